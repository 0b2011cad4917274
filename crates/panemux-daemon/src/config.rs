//! Session and layout YAML documents.
//!
//! Boundary interface: the orchestrator consumes these to name the tmux
//! session and to lay out the panel panes. Missing or empty files fall back
//! to compiled-in defaults; ratios are `a:b` strings converted to percents.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use panemux_tmux::layout::{LayoutPlan, PanelSpec, SplitSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("layout references unknown panel: {0}")]
    UnknownPanel(String),
}

/// Top-level session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_name")]
    pub name: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            name: default_session_name(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            session: SessionSection::default(),
        }
    }
}

/// Top-level layout document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub panels: Vec<PanelConfig>,
    #[serde(default)]
    pub splits: Vec<SplitConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    pub id: String,
    #[serde(default)]
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// `horizontal` or `vertical`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Panel id of the pane being split.
    pub target: String,
    /// Panel id created by this split.
    pub panel: String,
    /// `a:b` ratio; the new pane receives the `b` share.
    #[serde(default)]
    pub ratio: String,
}

fn default_version() -> String {
    "1.0".into()
}

fn default_session_name() -> String {
    "panemux".into()
}

impl Default for LayoutConfig {
    /// Built-in three-panel layout: sessions list on the left, messages as
    /// the main pane, input strip along the bottom.
    fn default() -> Self {
        Self {
            version: default_version(),
            panels: vec![
                PanelConfig {
                    id: "sessions".into(),
                    command: "panemux-panel --role sessions".into(),
                },
                PanelConfig {
                    id: "messages".into(),
                    command: "panemux-panel --role messages".into(),
                },
                PanelConfig {
                    id: "input".into(),
                    command: "panemux-panel --role input".into(),
                },
            ],
            splits: vec![
                SplitConfig {
                    kind: "horizontal".into(),
                    target: "sessions".into(),
                    panel: "messages".into(),
                    ratio: "1:4".into(),
                },
                SplitConfig {
                    kind: "vertical".into(),
                    target: "messages".into(),
                    panel: "input".into(),
                    ratio: "4:1".into(),
                },
            ],
        }
    }
}

impl LayoutConfig {
    /// Translate the document into the tmux crate's layout plan.
    pub fn to_plan(&self) -> Result<LayoutPlan, ConfigError> {
        let panels: Vec<PanelSpec> = self
            .panels
            .iter()
            .map(|p| PanelSpec {
                role: p.id.clone(),
                command: if p.command.is_empty() {
                    format!("panemux-panel --role {}", p.id)
                } else {
                    p.command.clone()
                },
            })
            .collect();

        let known = |id: &str| panels.iter().any(|p| p.role == id);
        let mut splits = Vec::with_capacity(self.splits.len());
        for split in &self.splits {
            if !known(&split.target) {
                return Err(ConfigError::UnknownPanel(split.target.clone()));
            }
            if !known(&split.panel) {
                return Err(ConfigError::UnknownPanel(split.panel.clone()));
            }
            splits.push(SplitSpec {
                horizontal: split.kind == "horizontal",
                target_role: split.target.clone(),
                new_role: split.panel.clone(),
                percent: ratio_percent(&split.ratio),
            });
        }

        Ok(LayoutPlan { panels, splits })
    }
}

/// Convert an `a:b` ratio into the percentage of the new pane (`b` share).
pub fn ratio_percent(value: &str) -> Option<u8> {
    let (a, b) = value.split_once(':')?;
    let a: u32 = a.trim().parse().ok()?;
    let b: u32 = b.trim().parse().ok()?;
    let total = a + b;
    if total == 0 {
        return None;
    }
    Some((b * 100 / total) as u8)
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(data) if data.trim().is_empty() => Ok(None),
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Load the session document, falling back to defaults when absent.
pub fn load_session(path: &Path) -> Result<SessionConfig, ConfigError> {
    match read_optional(path)? {
        None => Ok(SessionConfig::default()),
        Some(data) => serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Load the layout document, falling back to defaults when absent.
pub fn load_layout(path: &Path) -> Result<LayoutConfig, ConfigError> {
    match read_optional(path)? {
        None => Ok(LayoutConfig::default()),
        Some(data) => {
            let mut layout: LayoutConfig =
                serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    source: e,
                })?;
            if layout.panels.is_empty() {
                layout.panels = LayoutConfig::default().panels;
            }
            if layout.splits.is_empty() {
                layout.splits = LayoutConfig::default().splits;
            }
            Ok(layout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_produces_three_pane_plan() {
        let plan = LayoutConfig::default().to_plan().expect("plan");
        assert_eq!(plan.panels.len(), 3);
        assert_eq!(plan.splits.len(), 2);
        assert_eq!(plan.panels[0].role, "sessions");
        assert!(plan.splits[0].horizontal);
        assert_eq!(plan.splits[0].percent, Some(80));
        assert_eq!(plan.splits[1].percent, Some(20));
    }

    #[test]
    fn ratio_percent_math() {
        assert_eq!(ratio_percent("1:4"), Some(80));
        assert_eq!(ratio_percent("4:1"), Some(20));
        assert_eq!(ratio_percent("1:1"), Some(50));
        assert_eq!(ratio_percent("0:0"), None);
        assert_eq!(ratio_percent("nonsense"), None);
        assert_eq!(ratio_percent("1"), None);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let session = load_session(&tmp.path().join("absent.yaml")).expect("session");
        assert_eq!(session.session.name, "panemux");
        let layout = load_layout(&tmp.path().join("absent.yaml")).expect("layout");
        assert_eq!(layout.panels.len(), 3);
    }

    #[test]
    fn parses_session_yaml() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("session.yaml");
        std::fs::write(&path, "version: \"1.0\"\nsession:\n  name: devbox\n").unwrap();
        let session = load_session(&path).expect("session");
        assert_eq!(session.session.name, "devbox");
    }

    #[test]
    fn parses_layout_yaml_with_controller() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("layout.yaml");
        std::fs::write(
            &path,
            r#"
version: "1.0"
panels:
  - id: sessions
  - id: messages
  - id: input
  - id: controller
    command: panemux-panel --role controller --quiet
splits:
  - type: horizontal
    target: sessions
    panel: messages
    ratio: "1:3"
  - type: vertical
    target: messages
    panel: input
    ratio: "5:1"
  - type: vertical
    target: sessions
    panel: controller
    ratio: "9:1"
"#,
        )
        .unwrap();
        let layout = load_layout(&path).expect("layout");
        let plan = layout.to_plan().expect("plan");
        assert_eq!(plan.panels.len(), 4);
        assert_eq!(
            plan.command_for("controller"),
            Some("panemux-panel --role controller --quiet")
        );
        // panels without explicit commands get the default panel invocation
        assert_eq!(plan.command_for("input"), Some("panemux-panel --role input"));
    }

    #[test]
    fn layout_rejects_split_of_unknown_panel() {
        let layout = LayoutConfig {
            splits: vec![SplitConfig {
                kind: "horizontal".into(),
                target: "ghost".into(),
                panel: "messages".into(),
                ratio: String::new(),
            }],
            ..LayoutConfig::default()
        };
        assert!(matches!(
            layout.to_plan(),
            Err(ConfigError::UnknownPanel(_))
        ));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, "panels: [unclosed").unwrap();
        assert!(matches!(
            load_layout(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
