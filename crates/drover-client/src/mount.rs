//! Seams for the external collaborators a running job may need: the remote
//! file-system mount driver and the post-run behaviour engine.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self) -> Result<()>;

    /// Unmount, optionally forcing. Returns the driver's logs alongside the
    /// outcome so callers can surface them even when unmounting fails.
    async fn unmount(&self, force: bool) -> (String, Result<()>);
}

#[async_trait]
pub trait Behaviours: Send + Sync {
    async fn trigger(&self, success: bool) -> Result<()>;
}

/// For jobs with no remote file systems configured.
pub struct NoMounts;

#[async_trait]
impl Mounter for NoMounts {
    async fn mount(&self) -> Result<()> {
        Ok(())
    }

    async fn unmount(&self, _force: bool) -> (String, Result<()>) {
        (String::new(), Ok(()))
    }
}

/// For jobs with no post-run behaviours configured.
pub struct NoBehaviours;

#[async_trait]
impl Behaviours for NoBehaviours {
    async fn trigger(&self, _success: bool) -> Result<()> {
        Ok(())
    }
}
