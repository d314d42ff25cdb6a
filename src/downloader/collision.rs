//! Name-collision handling for destinations that already exist.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::CollisionPolicy;

/// User-decision prompt consulted when no policy was configured
///
/// The orchestrator awaits the answer inside the affected task only; other
/// tasks keep transferring while the prompt is open.
#[async_trait]
pub trait CollisionPrompt: Send + Sync {
    /// Choose what to do with an existing `destination`
    async fn decide(&self, destination: &Path, existing_len: u64) -> CollisionPolicy;
}

/// Prompt that always answers with the same policy
#[derive(Clone, Copy, Debug)]
pub struct FixedPrompt(pub CollisionPolicy);

impl Default for FixedPrompt {
    fn default() -> Self {
        Self(CollisionPolicy::Abort)
    }
}

#[async_trait]
impl CollisionPrompt for FixedPrompt {
    async fn decide(&self, _destination: &Path, _existing_len: u64) -> CollisionPolicy {
        self.0
    }
}

/// What the transfer does with the existing file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Truncate and download from the start
    Replace,
    /// Probe and continue from the existing length
    Resume,
    /// Leave the file alone
    Abort,
}

/// Pick a policy: request, then a sticky "overwrite all", then the
/// configured default, then the prompt.
pub(crate) async fn resolve(
    requested: Option<CollisionPolicy>,
    configured: Option<CollisionPolicy>,
    overwrite_all: &AtomicBool,
    prompt: &dyn CollisionPrompt,
    destination: &Path,
    existing_len: u64,
) -> Resolution {
    let policy = if let Some(policy) = requested {
        policy
    } else if overwrite_all.load(Ordering::SeqCst) {
        CollisionPolicy::Overwrite
    } else if let Some(policy) = configured {
        policy
    } else {
        prompt.decide(destination, existing_len).await
    };

    match policy {
        CollisionPolicy::Overwrite => Resolution::Replace,
        CollisionPolicy::OverwriteAll => {
            overwrite_all.store(true, Ordering::SeqCst);
            Resolution::Replace
        }
        CollisionPolicy::Resume => Resolution::Resume,
        CollisionPolicy::Abort => Resolution::Abort,
    }
}
