use async_trait::async_trait;

use crate::{SessionId, UploadResult, UploadSession};

/// Mutation applied to a session record inside the store's critical section.
///
/// Returning an error rejects the mutation; the stored record stays untouched.
pub type SessionMutator = Box<dyn FnOnce(&mut UploadSession) -> UploadResult<()> + Send>;

/// Durable storage for upload session state.
///
/// `update` is the only mutation path for an existing record and must be
/// read-modify-write atomic per session id: two concurrent updates of the same
/// session never lose each other's changes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new upload session, failing with `DuplicateSession` if the id exists
    async fn create(&self, session: UploadSession) -> UploadResult<()>;

    /// Get an upload session
    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession>;

    /// Apply `mutator` to the current record and persist the result
    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> UploadResult<UploadSession>;

    /// Delete an upload session; deleting an absent session is not an error
    async fn delete(&self, id: &SessionId) -> UploadResult<()>;

    /// All stored sessions, in no particular order
    async fn list(&self) -> UploadResult<Vec<UploadSession>>;
}

/// Box a closure as a [`SessionMutator`]
pub fn mutate<F>(f: F) -> SessionMutator
where
    F: FnOnce(&mut UploadSession) -> UploadResult<()> + Send + 'static,
{
    Box::new(f)
}
