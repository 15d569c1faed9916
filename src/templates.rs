use minijinja::Environment;
use serde::Serialize;

/// Values a prompt template can refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromptTemplateData {
    pub system_prompt: String,
    pub input: String,
    pub instruction: String,
}

/// Expands prompt templates by name.
pub trait PromptTemplates: Send + Sync {
    fn exists(&self, name: &str) -> bool;

    fn evaluate(&self, name: &str, data: &PromptTemplateData) -> anyhow::Result<String>;
}

/// Templates registered in memory and rendered with minijinja.
#[derive(Debug)]
pub struct JinjaTemplates {
    env: Environment<'static>,
}

impl JinjaTemplates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        JinjaTemplates { env }
    }

    pub fn with_template(mut self, name: &str, source: &str) -> anyhow::Result<Self> {
        self.add_template(name, source)?;
        Ok(self)
    }

    pub fn add_template(&mut self, name: &str, source: &str) -> anyhow::Result<()> {
        self.env
            .add_template_owned(name.to_string(), source.to_string())?;
        Ok(())
    }
}

impl Default for JinjaTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptTemplates for JinjaTemplates {
    fn exists(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    fn evaluate(&self, name: &str, data: &PromptTemplateData) -> anyhow::Result<String> {
        let tmpl = self.env.get_template(name)?;
        Ok(tmpl.render(data)?)
    }
}
