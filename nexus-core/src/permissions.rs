//! Permission presets, deltas, and the ceiling cascade enforced at agent
//! creation time. Path containment follows the normalize-then-`starts_with`
//! approach used for patch safety checks elsewhere in this codebase, generalized
//! to an arbitrary list of allowed roots instead of a single writable set.

use std::collections::HashMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("path '{path}' is outside allowed roots (reference: {reference})")]
pub struct PathSecurityError {
    pub path: PathBuf,
    pub reference: String,
}

impl PathSecurityError {
    pub fn new(path: impl Into<PathBuf>, reference: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reference: reference.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionLevel {
    Sandboxed,
    Trusted,
    Yolo,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionLevel::Sandboxed => "SANDBOXED",
            PermissionLevel::Trusted => "TRUSTED",
            PermissionLevel::Yolo => "YOLO",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub level: PermissionLevel,
    /// `None` means unrestricted.
    pub allowed_paths: Option<Vec<PathBuf>>,
    pub blocked_paths: Vec<PathBuf>,
}

impl PermissionPolicy {
    pub fn unrestricted(level: PermissionLevel) -> Self {
        Self {
            level,
            allowed_paths: None,
            blocked_paths: Vec::new(),
        }
    }

    pub fn restricted(level: PermissionLevel, allowed_paths: Vec<PathBuf>) -> Self {
        Self {
            level,
            allowed_paths: Some(allowed_paths),
            blocked_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPermission {
    pub enabled: bool,
    pub allowed_paths: Option<Vec<PathBuf>>,
    pub allowed_targets: Option<AllowedTargets>,
    pub timeout: Option<f64>,
}

impl Default for ToolPermission {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_paths: None,
            allowed_targets: None,
            timeout: None,
        }
    }
}

impl ToolPermission {
    pub fn enabled() -> Self {
        Self::default()
    }

    pub fn enabled_with_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            allowed_paths: Some(paths),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedTargets {
    Parent,
    Agents(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPermissions {
    pub base_preset: String,
    pub effective_policy: PermissionPolicy,
    pub tool_permissions: HashMap<String, ToolPermission>,
    pub ceiling: Option<Box<AgentPermissions>>,
    pub parent_agent_id: Option<String>,
    pub depth: u32,
}

impl AgentPermissions {
    pub fn from_preset(preset: &str, cwd: Option<&Path>) -> Self {
        let (level, allowed_paths) = match preset {
            "yolo" => (PermissionLevel::Yolo, None),
            "trusted" => (PermissionLevel::Trusted, None),
            "worker" | "sandboxed" | _ => (
                PermissionLevel::Sandboxed,
                Some(cwd.map(|p| vec![p.to_path_buf()]).unwrap_or_default()),
            ),
        };
        Self {
            base_preset: preset.to_string(),
            effective_policy: PermissionPolicy {
                level,
                allowed_paths,
                blocked_paths: Vec::new(),
            },
            tool_permissions: HashMap::new(),
            ceiling: None,
            parent_agent_id: None,
            depth: 0,
        }
    }

    /// True iff every permission `child` requests is covered by `self`.
    pub fn can_grant(&self, child: &AgentPermissions) -> bool {
        if child.effective_policy.level > self.effective_policy.level {
            return false;
        }

        if let Some(self_paths) = &self.effective_policy.allowed_paths {
            match &child.effective_policy.allowed_paths {
                None => return false,
                Some(child_paths) => {
                    if !child_paths
                        .iter()
                        .all(|p| is_contained_in_any(p, self_paths))
                    {
                        return false;
                    }
                }
            }
        }

        for (tool, child_perm) in &child.tool_permissions {
            if child_perm.enabled {
                let parent_perm = self.tool_permissions.get(tool);
                let parent_enabled = parent_perm.map(|p| p.enabled).unwrap_or(true);
                if !parent_enabled {
                    return false;
                }

                if let Some(child_paths) = &child_perm.allowed_paths
                    && let Some(parent_perm) = parent_perm
                    && let Some(parent_paths) = &parent_perm.allowed_paths
                    && !child_paths
                        .iter()
                        .all(|p| is_contained_in_any(p, parent_paths))
                {
                    return false;
                }
            }
        }

        true
    }

    pub fn apply_delta(&self, delta: &PermissionDelta) -> AgentPermissions {
        let mut result = self.clone();

        for tool in &delta.disable_tools {
            result
                .tool_permissions
                .insert(tool.clone(), ToolPermission::disabled());
        }
        for tool in &delta.enable_tools {
            result
                .tool_permissions
                .insert(tool.clone(), ToolPermission::enabled());
        }

        result
            .effective_policy
            .blocked_paths
            .extend(delta.add_blocked_paths.iter().cloned());

        if let Some(allowed) = &delta.allowed_paths {
            result.effective_policy.allowed_paths = Some(allowed.clone());
        }

        for (tool, perm) in &delta.tool_overrides {
            result.tool_permissions.insert(tool.clone(), perm.clone());
        }

        result
    }

    /// Enforce `allowed_targets` for a tool call against `target_agent_id`.
    pub fn check_allowed_target(
        &self,
        tool: &str,
        target_agent_id: &str,
    ) -> Result<(), String> {
        let Some(perm) = self.tool_permissions.get(tool) else {
            return Ok(());
        };
        match &perm.allowed_targets {
            None => Ok(()),
            Some(AllowedTargets::Parent) => match &self.parent_agent_id {
                None => Err("can only target parent agent ('none')".to_string()),
                Some(parent) if parent == target_agent_id => Ok(()),
                Some(parent) => Err(format!("can only target parent agent ('{parent}')")),
            },
            Some(AllowedTargets::Agents(ids)) => {
                if ids.iter().any(|id| id == target_agent_id) {
                    Ok(())
                } else {
                    Err(format!("target '{target_agent_id}' is not an allowed target"))
                }
            }
        }
    }
}

/// Whether an agent may call tools on the given MCP server. An agent with
/// no permissions object at all is denied rather than granted access; a
/// present but silent `tool_permissions` entry for the server still
/// defaults to enabled, same as any other tool.
pub fn can_use_mcp(permissions: Option<&AgentPermissions>, server_name: &str) -> bool {
    let Some(permissions) = permissions else {
        return false;
    };
    let key = format!("mcp__{server_name}");
    permissions.tool_permissions.get(&key).map(|p| p.enabled).unwrap_or(true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionDelta {
    #[serde(default)]
    pub disable_tools: Vec<String>,
    #[serde(default)]
    pub enable_tools: Vec<String>,
    #[serde(default)]
    pub add_blocked_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allowed_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolPermission>,
}

/// Normalize `.`/`..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_contained_in_any(path: &Path, roots: &[PathBuf]) -> bool {
    let abs = normalize(path);
    roots.iter().any(|root| abs.starts_with(normalize(root)))
}

/// Resolve `path` (absolute or relative to `cwd`) and require it to be
/// contained in one of `allowed_paths` (`None` means unrestricted).
pub fn validate_path(
    path: &Path,
    cwd: &Path,
    allowed_paths: Option<&[PathBuf]>,
) -> Result<PathBuf, PathSecurityError> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let abs = normalize(&abs);

    if let Some(allowed) = allowed_paths
        && !is_contained_in_any(&abs, allowed)
    {
        return Err(PathSecurityError::new(
            abs,
            allowed
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }

    Ok(abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn level_ordering() {
        assert!(PermissionLevel::Sandboxed < PermissionLevel::Trusted);
        assert!(PermissionLevel::Trusted < PermissionLevel::Yolo);
    }

    #[test]
    fn can_grant_rejects_higher_level() {
        let parent = AgentPermissions::from_preset("sandboxed", Some(Path::new("/tmp/a")));
        let child = AgentPermissions::from_preset("trusted", None);
        assert!(!parent.can_grant(&child));
    }

    #[test]
    fn can_grant_rejects_unrestricted_child_of_restricted_parent() {
        let parent = AgentPermissions::from_preset("sandboxed", Some(Path::new("/tmp/a")));
        let mut child = AgentPermissions::from_preset("sandboxed", None);
        child.effective_policy.allowed_paths = None;
        assert!(!parent.can_grant(&child));
    }

    #[test]
    fn can_grant_accepts_contained_paths() {
        let parent = AgentPermissions::from_preset("sandboxed", Some(Path::new("/tmp/a")));
        let child =
            AgentPermissions::from_preset("sandboxed", Some(Path::new("/tmp/a/sub")));
        assert!(parent.can_grant(&child));
    }

    #[test]
    fn apply_delta_is_idempotent() {
        let base = AgentPermissions::from_preset("sandboxed", Some(Path::new("/tmp/a")));
        let delta = PermissionDelta {
            disable_tools: vec!["write_file".to_string()],
            ..Default::default()
        };
        let once = base.apply_delta(&delta);
        let twice = once.apply_delta(&delta);
        assert_eq!(
            once.tool_permissions.get("write_file").unwrap().enabled,
            twice.tool_permissions.get("write_file").unwrap().enabled
        );
    }

    #[test]
    fn check_allowed_target_parent_none() {
        let perms = {
            let mut p = AgentPermissions::from_preset("sandboxed", None);
            p.tool_permissions.insert(
                "spawn_subagent".to_string(),
                ToolPermission {
                    allowed_targets: Some(AllowedTargets::Parent),
                    ..ToolPermission::default()
                },
            );
            p
        };
        let err = perms
            .check_allowed_target("spawn_subagent", "someone")
            .unwrap_err();
        assert!(err.contains("'none'"));
    }

    #[test]
    fn validate_path_rejects_escape() {
        let cwd = Path::new("/tmp/sandbox");
        let err = validate_path(
            Path::new("../../etc/passwd"),
            cwd,
            Some(&[PathBuf::from("/tmp/sandbox")]),
        )
        .unwrap_err();
        assert!(err.path.to_string_lossy().contains("etc/passwd"));
    }

    #[test]
    fn can_use_mcp_denies_by_default_with_no_permissions() {
        assert!(!can_use_mcp(None, "filesystem"));
    }

    #[test]
    fn can_use_mcp_allows_when_silent_on_server() {
        let perms = AgentPermissions::from_preset("trusted", None);
        assert!(can_use_mcp(Some(&perms), "filesystem"));
    }

    #[test]
    fn can_use_mcp_honors_explicit_disable() {
        let mut perms = AgentPermissions::from_preset("trusted", None);
        perms.tool_permissions.insert("mcp__filesystem".to_string(), ToolPermission::disabled());
        assert!(!can_use_mcp(Some(&perms), "filesystem"));
    }
}
