//! Coordinated roster refresh
//!
//! State changes request a refresh instead of rendering directly. The
//! [`RefreshCoordinator`] collapses bursts per guild into one prune, list and
//! render cycle, then schedules a follow-up for the nearest grace deadline.

pub mod coordinator;

pub use coordinator::{RefreshCoordinator, RefreshSettings, RefreshStats, RefreshStatsSnapshot};

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::types::RosterSnapshot;

/// Presentation collaborator that receives rendered rosters
#[async_trait]
pub trait RosterPresenter: Send + Sync {
    async fn render(&self, roster: &RosterSnapshot) -> Result<()>;
}

/// Presenter that only logs, used when no transport is wired
#[derive(Debug, Default)]
pub struct LoggingPresenter;

#[async_trait]
impl RosterPresenter for LoggingPresenter {
    async fn render(&self, roster: &RosterSnapshot) -> Result<()> {
        info!(
            "Roster for guild '{}': {} entries, next expiry {:?}",
            roster.guild_id,
            roster.len(),
            roster.next_expiry
        );
        Ok(())
    }
}
