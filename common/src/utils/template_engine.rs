pub use minijinja::{context, Environment, Value};
use std::sync::Arc;

pub trait ProvidesTemplateEngine {
    fn template_engine(&self) -> &Arc<TemplateEngine>;
}

/// Launch script templates compiled into the binary.
const SCRIPT_TEMPLATES: &[(&str, &str)] = &[
    (
        "jupyter_lab.sh",
        include_str!("../../templates/scripts/jupyter_lab.sh.j2"),
    ),
    ("appyter.sh", include_str!("../../templates/scripts/appyter.sh.j2")),
    (
        "local_test.sh",
        include_str!("../../templates/scripts/local_test.sh.j2"),
    ),
];

#[derive(Clone)]
pub struct TemplateEngine {
    env: Arc<Environment<'static>>,
}

impl TemplateEngine {
    pub fn embedded() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        for (name, source) in SCRIPT_TEMPLATES {
            env.add_template(name, source)?;
        }
        Ok(Self { env: Arc::new(env) })
    }

    pub fn render(&self, name: &str, ctx: &Value) -> Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_embedded_script_with_defaults() {
        let engine = TemplateEngine::embedded().expect("templates compile");
        let script = engine
            .render("local_test.sh", &context! { job_dir => "/tmp/.job" })
            .expect("render");

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("/tmp/.job/output.log"));
        assert!(script.contains("sleep 10"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        let engine = TemplateEngine::embedded().expect("templates compile");
        assert!(engine.render("missing.sh", &context! {}).is_err());
    }
}
