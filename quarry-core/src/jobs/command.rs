use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::ModelName;
use crate::settings::{DbtSettings, ProfileSettings};

/// A fully resolved external command.
#[derive(Clone, PartialEq, Eq)]
pub struct JobCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; the registry fills in the workspace when unset.
    pub current_dir: Option<PathBuf>,
    /// Short human-readable description shown in job listings.
    pub label: String,
}

// Environment values may carry secrets.
impl std::fmt::Debug for JobCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("JobCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("current_dir", &self.current_dir)
            .field("label", &self.label)
            .finish()
    }
}

impl JobCommand {
    /// Command running `program`, labelled with its name.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run in `dir` instead of the workspace.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Replace the listing label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// The two transformation CLI actions a learner can trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DbtInvocation {
    /// `dbt run` over a model selection.
    Run {
        /// Empty selects every model in the project.
        #[serde(default)]
        models: Vec<ModelName>,
        /// Also build models downstream of the selection (`model+`).
        #[serde(default)]
        include_children: bool,
        /// Rebuild incremental models from scratch.
        #[serde(default)]
        full_refresh: bool,
    },
    /// `dbt seed`.
    Seed,
}

impl DbtInvocation {
    /// A `run` invocation.
    pub fn run(models: Vec<ModelName>, include_children: bool, full_refresh: bool) -> Self {
        Self::Run {
            models,
            include_children,
            full_refresh,
        }
    }

    /// A `seed` invocation.
    pub fn seed() -> Self {
        Self::Seed
    }

    /// CLI subcommand name.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Seed => "seed",
        }
    }

    /// Build the command line for `workspace`. The database token, when
    /// configured, travels only through the environment.
    pub fn into_command(
        self,
        dbt: &DbtSettings,
        profile: &ProfileSettings,
        workspace: &Path,
    ) -> JobCommand {
        let workspace_arg = workspace.to_string_lossy().into_owned();
        let mut label = format!("dbt {}", self.subcommand());
        let mut command = JobCommand::new(dbt.executable.clone()).arg(self.subcommand());

        if let Self::Run {
            models,
            include_children,
            full_refresh,
        } = &self
        {
            if !models.is_empty() {
                let suffix = if *include_children { "+" } else { "" };
                let selectors: Vec<String> =
                    models.iter().map(|m| format!("{m}{suffix}")).collect();
                label = format!("{label} {}", selectors.join(" "));
                command = command.arg("--select").args(selectors);
            }
            if *full_refresh {
                command = command.arg("--full-refresh");
            }
        }

        command = command
            .args(["--profiles-dir", workspace_arg.as_str(), "--project-dir", workspace_arg.as_str()])
            .current_dir(workspace)
            .label(label);

        if let Some(token) = &dbt.database_token {
            command = command.env(profile.token_env_var.clone(), token.clone());
        }
        for (key, value) in &dbt.extra_env {
            command = command.env(key.clone(), value.clone());
        }

        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelName {
        ModelName::new(name).unwrap()
    }

    #[test]
    fn run_selects_models_with_children() {
        let dbt = DbtSettings {
            database_token: Some("secret".to_string()),
            ..DbtSettings::default()
        };
        let command = DbtInvocation::run(vec![model("stg_orders"), model("orders")], true, true)
            .into_command(&dbt, &ProfileSettings::default(), Path::new("/ws/u1/l1"));

        assert_eq!(command.program, "dbt");
        assert_eq!(
            command.args,
            [
                "run",
                "--select",
                "stg_orders+",
                "orders+",
                "--full-refresh",
                "--profiles-dir",
                "/ws/u1/l1",
                "--project-dir",
                "/ws/u1/l1",
            ]
        );
        assert_eq!(
            command.env,
            [("MOTHERDUCK_TOKEN".to_string(), "secret".to_string())]
        );
        assert_eq!(command.label, "dbt run stg_orders+ orders+");
        assert!(!format!("{command:?}").contains("secret"));
    }

    #[test]
    fn seed_has_no_selection() {
        let command = DbtInvocation::seed().into_command(
            &DbtSettings::default(),
            &ProfileSettings::default(),
            Path::new("/ws"),
        );
        assert_eq!(command.args[0], "seed");
        assert!(!command.args.iter().any(|a| a == "--select"));
        assert!(command.env.is_empty());
        assert_eq!(command.current_dir.as_deref(), Some(Path::new("/ws")));
    }

    #[test]
    fn invocation_deserializes_from_tagged_json() {
        let parsed: DbtInvocation =
            serde_json::from_str(r#"{"action":"run","models":["a"],"include_children":true}"#)
                .unwrap();
        assert_eq!(parsed, DbtInvocation::run(vec![model("a")], true, false));
    }
}
