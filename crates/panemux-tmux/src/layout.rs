//! Applies a panel layout to a fresh tmux session.
//!
//! The daemon translates its YAML layout document into [`LayoutPlan`]; this
//! module only knows how to realize a plan as a sequence of `new-session`
//! and `split-window` calls, returning the role → pane-target map the
//! supervisors key on.

use std::collections::HashMap;

use crate::error::TmuxError;
use crate::executor::TmuxCommandRunner;
use crate::pane::split_window;
use crate::session::new_session;

/// One panel to launch, keyed by its application role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelSpec {
    pub role: String,
    pub command: String,
}

/// One split step: carve a new pane for `new_role` out of the pane currently
/// holding `target_role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSpec {
    pub horizontal: bool,
    pub target_role: String,
    pub new_role: String,
    pub percent: Option<u8>,
}

/// A fully resolved layout: the first panel seeds the session, every split
/// adds one more pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    pub panels: Vec<PanelSpec>,
    pub splits: Vec<SplitSpec>,
}

impl LayoutPlan {
    pub fn command_for(&self, role: &str) -> Option<&str> {
        self.panels
            .iter()
            .find(|p| p.role == role)
            .map(|p| p.command.as_str())
    }
}

/// Create the session and apply every split. Returns role → pane target.
pub async fn apply_layout(
    runner: &impl TmuxCommandRunner,
    session: &str,
    plan: &LayoutPlan,
    env: &[(String, String)],
) -> Result<HashMap<String, String>, TmuxError> {
    let first = plan
        .panels
        .first()
        .ok_or_else(|| TmuxError::Parse("layout has no panels".into()))?;

    let mut targets = HashMap::new();
    let first_pane = new_session(runner, session, &first.command, env).await?;
    targets.insert(first.role.clone(), first_pane);

    for split in &plan.splits {
        let target = targets.get(&split.target_role).cloned().ok_or_else(|| {
            TmuxError::Parse(format!(
                "split targets unknown role: {}",
                split.target_role
            ))
        })?;
        let command = plan.command_for(&split.new_role).ok_or_else(|| {
            TmuxError::Parse(format!("split adds unknown role: {}", split.new_role))
        })?;
        let pane = split_window(
            runner,
            &target,
            split.horizontal,
            split.percent,
            command,
            env,
        )
        .await?;
        targets.insert(split.new_role.clone(), pane);
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and hands out sequential pane ids.
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        next_pane: Mutex<u32>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next_pane: Mutex::new(0),
            }
        }
    }

    impl TmuxCommandRunner for RecordingRunner {
        async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut next = self.next_pane.lock().unwrap();
            let id = format!("%{}", *next);
            *next += 1;
            Ok(id)
        }
    }

    fn three_pane_plan() -> LayoutPlan {
        LayoutPlan {
            panels: vec![
                PanelSpec { role: "sessions".into(), command: "panel --role sessions".into() },
                PanelSpec { role: "messages".into(), command: "panel --role messages".into() },
                PanelSpec { role: "input".into(), command: "panel --role input".into() },
            ],
            splits: vec![
                SplitSpec {
                    horizontal: true,
                    target_role: "sessions".into(),
                    new_role: "messages".into(),
                    percent: Some(80),
                },
                SplitSpec {
                    horizontal: false,
                    target_role: "messages".into(),
                    new_role: "input".into(),
                    percent: Some(20),
                },
            ],
        }
    }

    #[tokio::test]
    async fn apply_layout_maps_every_role() {
        let runner = RecordingRunner::new();
        let targets = apply_layout(&runner, "work", &three_pane_plan(), &[])
            .await
            .expect("should apply");

        assert_eq!(targets.len(), 3);
        assert_eq!(targets["sessions"], "%0");
        assert_eq!(targets["messages"], "%1");
        assert_eq!(targets["input"], "%2");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0][0], "new-session");
        assert_eq!(calls[1][0], "split-window");
        assert!(calls[1].contains(&"-h".to_string()));
        assert!(calls[2].contains(&"-v".to_string()));
        // input splits off the messages pane
        let t_pos = calls[2].iter().position(|a| a == "-t").expect("-t");
        assert_eq!(calls[2][t_pos + 1], "%1");
    }

    #[tokio::test]
    async fn apply_layout_rejects_unknown_split_target() {
        let runner = RecordingRunner::new();
        let mut plan = three_pane_plan();
        plan.splits[0].target_role = "ghost".into();
        let err = apply_layout(&runner, "work", &plan, &[]).await.unwrap_err();
        assert!(matches!(err, TmuxError::Parse(_)));
    }

    #[tokio::test]
    async fn apply_layout_rejects_empty_plan() {
        let runner = RecordingRunner::new();
        let plan = LayoutPlan { panels: vec![], splits: vec![] };
        assert!(apply_layout(&runner, "work", &plan, &[]).await.is_err());
    }
}
