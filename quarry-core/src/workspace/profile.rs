//! Generated per-workspace configuration.

use std::fmt;

use crate::ids::{ContentSetId, TenantId};
use crate::settings::ProfileSettings;

/// Produces the generated configuration file written into every new
/// workspace.
pub trait ProfileRenderer: Send + Sync {
    /// File name (relative to the workspace root). Its presence marks a
    /// workspace as fully initialized.
    fn file_name(&self) -> &str;

    /// File contents for the given workspace.
    fn render(&self, tenant: &TenantId, content_set: &ContentSetId) -> String;
}

/// Renders a dbt `profiles.yml` targeting the tenant's schema.
#[derive(Clone)]
pub struct DbtProfileRenderer {
    settings: ProfileSettings,
}

impl fmt::Debug for DbtProfileRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbtProfileRenderer")
            .field("profile", &self.settings.profile_name)
            .field("adapter", &self.settings.adapter)
            .finish_non_exhaustive()
    }
}

impl DbtProfileRenderer {
    /// Renderer for the given profile shape.
    pub fn new(settings: ProfileSettings) -> Self {
        Self { settings }
    }
}

impl ProfileRenderer for DbtProfileRenderer {
    fn file_name(&self) -> &str {
        &self.settings.file_name
    }

    fn render(&self, tenant: &TenantId, _content_set: &ContentSetId) -> String {
        let ProfileSettings {
            profile_name,
            target,
            adapter,
            database,
            schema_prefix,
            threads,
            token_env_var,
            ..
        } = &self.settings;
        let schema = tenant.namespace(schema_prefix);

        format!(
            "{profile_name}:\n  \
             target: {target}\n  \
             outputs:\n    \
             {target}:\n      \
             type: {adapter}\n      \
             path: \"{database}\"\n      \
             schema: {schema}\n      \
             threads: {threads}\n      \
             motherduck_token: \"{{{{ env_var('{token_env_var}') }}}}\"\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tenant_schema_without_secret() {
        let renderer = DbtProfileRenderer::new(ProfileSettings::default());
        let tenant = TenantId::new("u-7").unwrap();
        let lesson = ContentSetId::new("lesson1").unwrap();

        let rendered = renderer.render(&tenant, &lesson);

        assert!(rendered.starts_with("quarry:\n  target: dev\n"));
        assert!(rendered.contains("      schema: learner_u_7\n"));
        assert!(rendered.contains("      type: duckdb\n"));
        assert!(
            rendered.contains("\"{{ env_var('MOTHERDUCK_TOKEN') }}\"")
        );
    }
}
