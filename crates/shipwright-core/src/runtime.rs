use anyhow::Result;
use async_trait::async_trait;

use crate::types::{RegistryAuth, RunOutput};

/// The container engine that holds the devops image.
///
/// Both calls may be slow and may fail; callers never hold a lock across
/// them other than the per-stack deploy key.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image:tag`, returning the last status line the engine printed.
    async fn pull(&self, image: &str, tag: &str, auth: &RegistryAuth) -> Result<String>;

    /// Run `args` in a throwaway container of `image:tag` and wait for it.
    /// `env` entries are `KEY=value`.
    async fn run(&self, image: &str, tag: &str, args: &[String], env: &[String]) -> Result<RunOutput>;
}

/// `image:tag`, or just `image` when the tag is empty.
pub fn image_ref(image: &str, tag: &str) -> String {
    if tag.is_empty() {
        image.to_string()
    } else {
        format!("{image}:{tag}")
    }
}
