//! Project scaffolding contract.
//!
//! Templates themselves are external; the default [`FsScaffolder`]
//! writes minimal stubs. Every operation is idempotent — safe on each
//! open().

use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use crate::config::ConfigSnapshot;

#[async_trait]
pub trait Scaffolder: Send + Sync {
    /// Create the support file if the config names one that is absent.
    async fn ensure_support_files(
        &self,
        folder: &Path,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()>;

    /// Seed the active spec folder with an example when it is empty.
    async fn ensure_example_specs(
        &self,
        folder: &Path,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()>;

    /// Create a stub plugins file if the config names one that is
    /// absent. Must run before plugin host init.
    async fn ensure_plugins_stub(
        &self,
        folder: &Path,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()>;
}

/// Default filesystem scaffolder.
pub struct FsScaffolder;

impl FsScaffolder {
    async fn write_if_absent(path: &Path, contents: &str) -> anyhow::Result<bool> {
        if tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        debug!(path = %path.display(), "scaffolded");
        Ok(true)
    }
}

#[async_trait]
impl Scaffolder for FsScaffolder {
    async fn ensure_support_files(
        &self,
        _folder: &Path,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()> {
        if let Some(support) = &config.support_file {
            Self::write_if_absent(
                support,
                "# Shared support configuration loaded before every spec.\n",
            )
            .await?;
        }
        Ok(())
    }

    async fn ensure_example_specs(
        &self,
        folder: &Path,
        _config: &ConfigSnapshot,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(folder).await?;
        let mut entries = tokio::fs::read_dir(folder).await?;
        if entries.next_entry().await?.is_some() {
            return Ok(());
        }
        Self::write_if_absent(
            &folder.join("example.spec.toml"),
            "# Example spec. Replace with your own.\n[spec]\nname = \"example\"\n",
        )
        .await?;
        Ok(())
    }

    async fn ensure_plugins_stub(
        &self,
        _folder: &Path,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<()> {
        if let Some(plugins) = &config.plugins_file {
            Self::write_if_absent(plugins, "# Plugin configuration.\n[plugins]\n").await?;
        }
        Ok(())
    }
}
