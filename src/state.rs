use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NovelError, Result};

/// Project lifecycle. Forward edges follow artifact creation; backward edges
/// exist only for regeneration, which cascades away the downstream artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    BlueprintReady,
    PartOutlinesReady,
    ChapterOutlinesReady,
    Writing,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::BlueprintReady => "blueprint_ready",
            ProjectStatus::PartOutlinesReady => "part_outlines_ready",
            ProjectStatus::ChapterOutlinesReady => "chapter_outlines_ready",
            ProjectStatus::Writing => "writing",
            ProjectStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "blueprint_ready" => ProjectStatus::BlueprintReady,
            "part_outlines_ready" => ProjectStatus::PartOutlinesReady,
            "chapter_outlines_ready" => ProjectStatus::ChapterOutlinesReady,
            "writing" => ProjectStatus::Writing,
            "completed" => ProjectStatus::Completed,
            _ => ProjectStatus::Draft,
        }
    }

    fn can_transition(self, to: ProjectStatus) -> bool {
        use ProjectStatus::*;
        if self == to {
            return true;
        }
        match (self, to) {
            // Forward, in creation order.
            (Draft, BlueprintReady) => true,
            (BlueprintReady, PartOutlinesReady) => true,
            (BlueprintReady, ChapterOutlinesReady) => true,
            (PartOutlinesReady, ChapterOutlinesReady) => true,
            (ChapterOutlinesReady, Writing) => true,
            (Writing, Completed) => true,
            // Backward, for regeneration after a cascade delete.
            (_, BlueprintReady) => true,
            (ChapterOutlinesReady | Writing | Completed, PartOutlinesReady) => true,
            (Writing | Completed, ChapterOutlinesReady) => true,
            (Completed, Writing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    NotGenerated,
    Generating,
    WaitingForConfirm,
    Evaluating,
    Successful,
    Failed,
    EvaluationFailed,
}

impl ChapterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChapterStatus::NotGenerated => "not_generated",
            ChapterStatus::Generating => "generating",
            ChapterStatus::WaitingForConfirm => "waiting_for_confirm",
            ChapterStatus::Evaluating => "evaluating",
            ChapterStatus::Successful => "successful",
            ChapterStatus::Failed => "failed",
            ChapterStatus::EvaluationFailed => "evaluation_failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => ChapterStatus::Generating,
            "waiting_for_confirm" => ChapterStatus::WaitingForConfirm,
            "evaluating" => ChapterStatus::Evaluating,
            "successful" => ChapterStatus::Successful,
            "failed" => ChapterStatus::Failed,
            "evaluation_failed" => ChapterStatus::EvaluationFailed,
            _ => ChapterStatus::NotGenerated,
        }
    }

    fn can_transition(self, to: ChapterStatus) -> bool {
        use ChapterStatus::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (NotGenerated, Generating) => true,
            (Generating, WaitingForConfirm | Failed) => true,
            (WaitingForConfirm, Evaluating | Successful | Generating) => true,
            (Evaluating, Successful | EvaluationFailed) => true,
            (EvaluationFailed, Evaluating | Generating) => true,
            // Failed chapters and confirmed chapters may be regenerated.
            (Failed | Successful, Generating) => true,
            // Cascade deletes drop a chapter back to square one.
            (_, NotGenerated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Central transition guard. `force` is the recovery hatch: it skips the
/// check but still logs the jump.
pub fn ensure_project_transition(
    from: ProjectStatus,
    to: ProjectStatus,
    force: bool,
) -> Result<()> {
    if force {
        if from != to {
            tracing::warn!("forced project transition {} -> {}", from, to);
        }
        return Ok(());
    }
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(NovelError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub fn ensure_chapter_transition(
    from: ChapterStatus,
    to: ChapterStatus,
    force: bool,
) -> Result<()> {
    if force {
        if from != to {
            tracing::warn!("forced chapter transition {} -> {}", from, to);
        }
        return Ok(());
    }
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(NovelError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_project_path() {
        use ProjectStatus::*;
        for (from, to) in [
            (Draft, BlueprintReady),
            (BlueprintReady, PartOutlinesReady),
            (PartOutlinesReady, ChapterOutlinesReady),
            (BlueprintReady, ChapterOutlinesReady),
            (ChapterOutlinesReady, Writing),
            (Writing, Completed),
        ] {
            assert!(ensure_project_transition(from, to, false).is_ok());
        }
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        assert!(matches!(
            ensure_project_transition(ProjectStatus::Draft, ProjectStatus::Writing, false),
            Err(NovelError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn force_overrides_rejection() {
        assert!(
            ensure_project_transition(ProjectStatus::Draft, ProjectStatus::Writing, true).is_ok()
        );
    }

    #[test]
    fn chapter_regeneration_allowed_from_terminal_states() {
        assert!(ensure_chapter_transition(
            ChapterStatus::Failed,
            ChapterStatus::Generating,
            false
        )
        .is_ok());
        assert!(ensure_chapter_transition(
            ChapterStatus::Successful,
            ChapterStatus::Generating,
            false
        )
        .is_ok());
        assert!(matches!(
            ensure_chapter_transition(
                ChapterStatus::NotGenerated,
                ChapterStatus::Successful,
                false
            ),
            Err(NovelError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            ProjectStatus::Draft,
            ProjectStatus::BlueprintReady,
            ProjectStatus::PartOutlinesReady,
            ProjectStatus::ChapterOutlinesReady,
            ProjectStatus::Writing,
            ProjectStatus::Completed,
        ] {
            assert_eq!(ProjectStatus::parse(s.as_str()), s);
        }
    }
}
