//! Backend handle lifecycle, supplied by the storage glue

use async_trait::async_trait;

use crate::error::Result;

/// Creates, checks and closes the handles a [`ResourcePool`](super::ResourcePool)
/// hands out (database connections, file handles, sockets...).
#[async_trait]
pub trait HandleManager: Send + Sync + 'static {
    /// The pooled handle type
    type Handle: Send + Sync + 'static;

    /// Open a new handle. An error is reported to the acquirer as
    /// [`Error::HandleCreation`](crate::Error::HandleCreation).
    async fn create(&self) -> Result<Self::Handle>;

    /// Round-trip check run on release and during health checks
    async fn validate(&self, handle: &Self::Handle) -> bool;

    /// Release backend resources. Must not fail.
    async fn close(&self, handle: Self::Handle);
}
