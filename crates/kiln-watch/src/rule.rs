//! Watch rules: glob sets mapped to tasks and pipelines.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use kiln_bundle::PipelineRegistry;
use kiln_tasks::TaskRegistry;
use kiln_types::{KilnError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchTarget {
    /// A named task, invoked directly.
    Task(String),
    /// A bundle pipeline, keyed by output path, rebuilt incrementally.
    Pipeline(String),
}

impl WatchTarget {
    /// Resolve a bare name: task names take precedence over bundle outputs.
    pub fn resolve(name: &str, tasks: &TaskRegistry, pipelines: &PipelineRegistry) -> Result<Self> {
        if tasks.contains(name) {
            Ok(WatchTarget::Task(name.to_string()))
        } else if pipelines.contains(name) {
            Ok(WatchTarget::Pipeline(name.to_string()))
        } else {
            Err(KilnError::Config(format!(
                "watch target '{}' is neither a task nor a bundle output",
                name
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchRule {
    pub globs: Vec<String>,
    pub targets: Vec<WatchTarget>,
}

impl WatchRule {
    pub fn new<I, S>(globs: I, targets: Vec<WatchTarget>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            globs: globs.into_iter().map(Into::into).collect(),
            targets,
        }
    }
}

/// Compile root-relative globs. `*` does not cross `/`; `**` does.
pub fn compile_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| KilnError::InvalidGlob {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| KilnError::InvalidGlob {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_bundle::BundleDescriptor;
    use kiln_tasks::action_fn;
    use kiln_types::EventEmitter;

    #[test]
    fn globs_match_like_shell_patterns() {
        let set = compile_globs(&["public/scss/*.scss".into(), "server/**/*.js".into()]).unwrap();
        assert!(set.is_match("public/scss/main.scss"));
        assert!(!set.is_match("public/scss/partials/_x.scss"));
        assert!(set.is_match("server/index.js"));
        assert!(set.is_match("server/routes/api/v1.js"));
        assert!(!set.is_match("public/js/app.js"));
    }

    #[test]
    fn bad_glob_names_the_pattern() {
        let err = compile_globs(&["ok/*".into(), "bad/[".into()]).unwrap_err();
        assert!(matches!(err, KilnError::InvalidGlob { ref pattern, .. } if pattern == "bad/["));
    }

    #[test]
    fn targets_resolve_against_both_registries() {
        let mut tasks = TaskRegistry::new();
        tasks.register("css", action_fn(|| async { Ok(()) })).unwrap();
        let mut pipelines = PipelineRegistry::new("/p", "/p/build", EventEmitter::default());
        pipelines
            .register(BundleDescriptor::new("js/main.js", vec!["a.js".into()]))
            .unwrap();

        assert_eq!(
            WatchTarget::resolve("css", &tasks, &pipelines).unwrap(),
            WatchTarget::Task("css".into())
        );
        assert_eq!(
            WatchTarget::resolve("js/main.js", &tasks, &pipelines).unwrap(),
            WatchTarget::Pipeline("js/main.js".into())
        );
        assert!(matches!(
            WatchTarget::resolve("templates", &tasks, &pipelines),
            Err(KilnError::Config(_))
        ));
    }
}
