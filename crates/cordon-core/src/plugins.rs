//! Build-time plugins.
//!
//! A plugin edits the environment under construction: it can add
//! capabilities, roots and audit sinks, or tighten the policy. Plugins run
//! in ascending `priority` order before cross-process validation, so what
//! they add is checked like everything else.

use std::path::PathBuf;

use crate::audit::AuditSinkSpec;
use crate::capability::{BudgetSpec, CapabilitySpec};
use crate::error::Result;
use crate::policy::Policy;
use crate::roots::RootSpec;

/// What a plugin may change.
pub struct PluginContext<'a> {
    pub policy: &'a mut Policy,
    pub capabilities: &'a mut Vec<CapabilitySpec>,
    pub roots: &'a mut Vec<RootSpec>,
    pub audit_sinks: &'a mut Vec<AuditSinkSpec>,
    /// Locale for result error messages.
    pub locale: &'a mut String,
}

impl PluginContext<'_> {
    pub fn add_capability(&mut self, spec: CapabilitySpec) {
        self.capabilities.push(spec);
    }

    pub fn add_root(&mut self, spec: RootSpec) {
        self.roots.push(spec);
    }

    pub fn add_audit_sink(&mut self, spec: AuditSinkSpec) {
        self.audit_sinks.push(spec);
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
}

/// Run `plugins` in priority order; ties keep their given order.
pub fn apply_plugins(plugins: &[Box<dyn Plugin>], ctx: &mut PluginContext<'_>) -> Result<()> {
    let mut ordered: Vec<&dyn Plugin> = plugins.iter().map(|p| p.as_ref()).collect();
    ordered.sort_by_key(|p| p.priority());
    for plugin in ordered {
        tracing::debug!(event = "plugin.setup", plugin = plugin.name(), priority = plugin.priority());
        plugin.setup(ctx)?;
    }
    Ok(())
}

/// Exposes a `math` root with a configurable subset.
#[derive(Debug, Clone)]
pub struct MathRootsPlugin {
    pub allow_sin: bool,
    pub allow_cos: bool,
    pub allow_pi: bool,
}

impl Default for MathRootsPlugin {
    fn default() -> Self {
        Self {
            allow_sin: true,
            allow_cos: true,
            allow_pi: true,
        }
    }
}

impl Plugin for MathRootsPlugin {
    fn name(&self) -> &str {
        "math_roots"
    }

    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let mut spec = RootSpec::new("math", "math");
        if self.allow_sin {
            spec = spec.allow_call("sin");
        }
        if self.allow_cos {
            spec = spec.allow_call("cos");
        }
        if self.allow_pi {
            spec = spec.allow_value("pi");
        }
        if !spec.allow_tree.is_empty() {
            ctx.add_root(spec);
        }
        Ok(())
    }
}

/// Registers `upper`, `lower` and `count_words`.
#[derive(Debug, Clone)]
pub struct TextCapsPlugin {
    pub max_calls: u64,
}

impl Default for TextCapsPlugin {
    fn default() -> Self {
        Self { max_calls: 100 }
    }
}

impl Plugin for TextCapsPlugin {
    fn name(&self) -> &str {
        "text_caps"
    }

    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let budget = BudgetSpec::default().with_max_calls(self.max_calls);
        for (name, path) in [
            ("upper", "text:upper"),
            ("lower", "text:lower"),
            ("count_words", "text:count_words"),
        ] {
            ctx.add_capability(CapabilitySpec::from_path(name, path).with_budget(budget.clone()));
        }
        Ok(())
    }
}

/// Appends audit events to a JSONL file.
#[derive(Debug, Clone)]
pub struct AuditFilePlugin {
    pub path: PathBuf,
}

impl AuditFilePlugin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Plugin for AuditFilePlugin {
    fn name(&self) -> &str {
        "audit_file"
    }

    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.add_audit_sink(AuditSinkSpec::File {
            path: self.path.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    struct Recorder {
        name: &'static str,
        priority: i32,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
            ctx.add_capability(CapabilitySpec::from_path(self.name, "text:upper"));
            Ok(())
        }
    }

    struct Failing;

    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn setup(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
            Err(SandboxError::InvalidConfig("plugin refused".into()))
        }
    }

    fn run(plugins: Vec<Box<dyn Plugin>>) -> Result<(Policy, Vec<CapabilitySpec>, Vec<RootSpec>, Vec<AuditSinkSpec>)> {
        let mut policy = Policy::default();
        let mut caps = Vec::new();
        let mut roots = Vec::new();
        let mut sinks = Vec::new();
        let mut locale = String::from("en");
        let mut ctx = PluginContext {
            policy: &mut policy,
            capabilities: &mut caps,
            roots: &mut roots,
            audit_sinks: &mut sinks,
            locale: &mut locale,
        };
        apply_plugins(&plugins, &mut ctx)?;
        Ok((policy, caps, roots, sinks))
    }

    #[test]
    fn test_priority_order() {
        let (_, caps, _, _) = run(vec![
            Box::new(Recorder { name: "late", priority: 10 }),
            Box::new(Recorder { name: "early", priority: -1 }),
            Box::new(Recorder { name: "middle", priority: 0 }),
        ])
        .unwrap();
        let names: Vec<_> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["early", "middle", "late"]);
    }

    #[test]
    fn test_shipped_plugins() {
        let (_, caps, roots, sinks) = run(vec![
            Box::new(MathRootsPlugin {
                allow_cos: false,
                ..Default::default()
            }),
            Box::new(TextCapsPlugin::default()),
            Box::new(AuditFilePlugin::new("/tmp/audit.jsonl")),
        ])
        .unwrap();
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[0].budget.max_calls, Some(100));
        assert_eq!(
            roots[0].attrs().into_iter().collect::<Vec<_>>(),
            ["pi", "sin"]
        );
        assert_eq!(sinks[0].kind(), "file");
    }

    #[test]
    fn test_math_plugin_with_nothing_allowed_adds_no_root() {
        let (_, _, roots, _) = run(vec![Box::new(MathRootsPlugin {
            allow_sin: false,
            allow_cos: false,
            allow_pi: false,
        })])
        .unwrap();
        assert!(roots.is_empty());
    }

    #[test]
    fn test_plugin_error_propagates() {
        match run(vec![Box::new(Failing)]) {
            Err(SandboxError::InvalidConfig(msg)) => assert_eq!(msg, "plugin refused"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }
}
