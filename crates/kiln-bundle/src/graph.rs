//! Built-in transform adapter: a cached CommonJS module graph bundler.
//!
//! Starting from the entry files, relative `require("./x")` calls are
//! resolved and followed. Each module's transformed source and dependency
//! list is cached by absolute path, so after [`invalidate`] only the changed
//! modules are read and transformed again; everything else is reassembled
//! from cache.
//!
//! [`invalidate`]: TransformAdapter::invalidate

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;

use kiln_types::{KilnError, Result};

use crate::adapter::{LogSink, TransformAdapter, TransformOutput};
use crate::descriptor::TransformConfig;
use crate::sourcemap::SourceMapBuilder;
use crate::transforms::{build_chain, JsonTransform, ModuleTransform};

const PRELUDE: &str = "(function (modules, entries) {
  var cache = {};
  function load(id) {
    if (cache[id]) return cache[id].exports;
    var module = (cache[id] = { exports: {} });
    var def = modules[id];
    def[0].call(module.exports, function (name) {
      var dep = def[1][name];
      if (dep !== undefined) return load(dep);
      if (typeof require === \"function\") return require(name);
      throw new Error(\"Cannot find module '\" + name + \"'\");
    }, module, module.exports);
    return module.exports;
  }
  entries.forEach(load);
})({";

fn require_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"require\(\s*["']([^"']+)["']\s*\)"#).expect("require pattern is valid")
    })
}

/// A module as it was last read and transformed.
#[derive(Debug, Clone)]
struct CachedModule {
    original: String,
    code: String,
    /// Relative specifiers and the files they resolved to, in source order.
    deps: Vec<(String, PathBuf)>,
}

pub struct ModuleGraphAdapter {
    root: PathBuf,
    output_name: String,
    debug: bool,
    chain: Vec<Box<dyn ModuleTransform>>,
    cache: HashMap<PathBuf, CachedModule>,
    order: Vec<PathBuf>,
}

impl ModuleGraphAdapter {
    /// `root` is the project root entry paths are relative to. `output_name`
    /// is recorded as the sourcemap's `file`.
    pub fn new(
        root: impl Into<PathBuf>,
        output_name: impl Into<String>,
        transforms: &[TransformConfig],
        debug: bool,
    ) -> Self {
        let mut chain = build_chain(transforms);
        if !transforms.contains(&TransformConfig::Json) {
            chain.push(Box::new(JsonTransform));
        }
        Self {
            root: root.into(),
            output_name: output_name.into(),
            debug,
            chain,
            cache: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Number of modules currently held in the cache.
    pub fn cached_modules(&self) -> usize {
        self.cache.len()
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    async fn load(&self, path: &Path) -> Result<CachedModule> {
        let original = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::Transform {
                file: self.display(path),
                message: e.to_string(),
            })?;

        let mut code = original.clone();
        for transform in &self.chain {
            if transform.applies_to(path) {
                code = transform.transform(path, code).await?;
            }
        }

        let base = path.parent().unwrap_or(&self.root);
        let specifiers: Vec<String> = require_pattern()
            .captures_iter(&code)
            .map(|capture| capture[1].to_string())
            .collect();

        let mut deps = Vec::new();
        let mut seen = HashSet::new();
        for specifier in specifiers {
            if !specifier.starts_with("./") && !specifier.starts_with("../") {
                tracing::debug!(
                    module = %self.display(path),
                    %specifier,
                    "Leaving bare require external"
                );
                continue;
            }
            if !seen.insert(specifier.clone()) {
                continue;
            }
            let resolved = resolve(base, &specifier).await.ok_or_else(|| KilnError::Transform {
                file: self.display(path),
                message: format!("Cannot find module '{}'", specifier),
            })?;
            deps.push((specifier, resolved));
        }

        Ok(CachedModule {
            original,
            code,
            deps,
        })
    }

    fn render(&self, order: &[PathBuf], entries: &[usize]) -> (String, Option<String>) {
        let ids: HashMap<&PathBuf, usize> = order.iter().enumerate().map(|(i, p)| (p, i)).collect();
        let mut map = SourceMapBuilder::new();
        let mut lines: Vec<String> = Vec::new();

        for line in PRELUDE.lines() {
            lines.push(line.to_string());
            map.unmapped_line();
        }

        for (id, path) in order.iter().enumerate() {
            let module = &self.cache[path];
            let source = map.add_source(self.display(path), module.original.clone());
            let original_lines = module.original.lines().count().max(1);

            lines.push(format!("{}: [function (require, module, exports) {{", id));
            map.unmapped_line();
            for (n, line) in module.code.lines().enumerate() {
                lines.push(line.to_string());
                map.mapped_line(source, n.min(original_lines - 1));
            }

            let dep_ids: Vec<String> = module
                .deps
                .iter()
                .map(|(spec, dep)| {
                    let spec = serde_json::Value::String(spec.clone());
                    format!("{}: {}", spec, ids[dep])
                })
                .collect();
            let sep = if id + 1 < order.len() { "," } else { "" };
            lines.push(format!("}}, {{{}}}]{}", dep_ids.join(", "), sep));
            map.unmapped_line();
        }

        let entry_ids: Vec<String> = entries.iter().map(|id| id.to_string()).collect();
        lines.push(format!("}}, [{}]);", entry_ids.join(", ")));
        map.unmapped_line();

        let mut code = lines.join("\n");
        code.push('\n');

        let sourcemap = if self.debug {
            map.to_json(&self.output_name).ok()
        } else {
            None
        };
        (code, sourcemap)
    }
}

#[async_trait]
impl TransformAdapter for ModuleGraphAdapter {
    fn name(&self) -> &str {
        "module-graph"
    }

    async fn bundle(&mut self, entries: &[PathBuf], sink: &dyn LogSink) -> Result<TransformOutput> {
        let started = Instant::now();
        let mut order: Vec<PathBuf> = Vec::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut entry_paths = Vec::with_capacity(entries.len());
        let mut rebuilt = 0;

        for entry in entries {
            let path = normalize(&self.root.join(entry));
            if !is_file(&path).await {
                return Err(KilnError::Transform {
                    file: self.display(&path),
                    message: "Cannot find entry module".into(),
                });
            }
            entry_paths.push(path);
        }

        // Depth-first, pre-order, dependencies in source order.
        let mut stack: Vec<PathBuf> = entry_paths.iter().rev().cloned().collect();
        while let Some(path) = stack.pop() {
            if !visited.insert(path.clone()) {
                continue;
            }
            if !self.cache.contains_key(&path) {
                let module = self.load(&path).await?;
                self.cache.insert(path.clone(), module);
                rebuilt += 1;
            }
            for (_, dep) in self.cache[&path].deps.iter().rev() {
                if !visited.contains(dep) {
                    stack.push(dep.clone());
                }
            }
            order.push(path);
        }

        self.cache.retain(|path, _| visited.contains(path));

        let index: HashMap<&PathBuf, usize> =
            order.iter().enumerate().map(|(i, p)| (p, i)).collect();
        let entry_ids: Vec<usize> = entry_paths.iter().map(|p| index[p]).collect();
        let (code, sourcemap) = self.render(&order, &entry_ids);

        sink.log(&format!(
            "{} bytes written ({} of {} modules rebuilt, {:.2} seconds)",
            code.len(),
            rebuilt,
            order.len(),
            started.elapsed().as_secs_f64()
        ));

        let total = order.len();
        self.order = order;
        Ok(TransformOutput {
            code: code.into_bytes(),
            sourcemap,
            modules_total: total,
            modules_rebuilt: rebuilt,
        })
    }

    fn invalidate(&mut self, path: &Path) -> bool {
        let path = normalize(&self.root.join(path));
        self.cache.remove(&path).is_some()
    }

    fn reset(&mut self) {
        self.cache.clear();
    }

    fn dependencies(&self) -> Vec<PathBuf> {
        self.order.clone()
    }
}

/// Resolve a relative specifier the way CommonJS does for local files.
async fn resolve(base: &Path, specifier: &str) -> Option<PathBuf> {
    let candidate = normalize(&base.join(specifier));
    let mut candidates = vec![candidate.clone()];
    for ext in ["js", "json"] {
        candidates.push(PathBuf::from(format!("{}.{}", candidate.display(), ext)));
    }
    candidates.push(candidate.join("index.js"));

    for path in candidates {
        if is_file(&path).await {
            return Some(path);
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Lexically collapse `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Lines(Mutex<Vec<String>>);

    impl LogSink for Lines {
        fn log(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn sink() -> Lines {
        Lines(Mutex::new(Vec::new()))
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn normalize_collapses_parent_components() {
        assert_eq!(
            normalize(Path::new("/p/src/main/../lib/./util.js")),
            PathBuf::from("/p/src/lib/util.js")
        );
    }

    #[tokio::test]
    async fn follows_relative_requires_in_source_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/index.js", "var a = require('./a');\nvar lib = require(\"../lib\");\n");
        write(root, "src/a.js", "module.exports = require('./b');\n");
        write(root, "src/b.js", "module.exports = 2;\n");
        write(root, "lib/index.js", "module.exports = 'lib';\n");

        let mut adapter = ModuleGraphAdapter::new(root, "main.js", &[], false);
        let out = adapter.bundle(&["src/index.js".into()], &sink()).await.unwrap();

        assert_eq!(out.modules_total, 4);
        assert_eq!(out.modules_rebuilt, 4);
        assert!(out.sourcemap.is_none());
        let deps: Vec<String> = adapter
            .dependencies()
            .iter()
            .map(|p| adapter.display(p))
            .collect();
        assert_eq!(deps, vec!["src/index.js", "src/a.js", "src/b.js", "lib/index.js"]);

        let code = String::from_utf8(out.code).unwrap();
        assert!(code.contains("{\"./a\": 1, \"../lib\": 3}"));
        assert!(code.trim_end().ends_with("}, [0]);"));
    }

    #[tokio::test]
    async fn invalidate_rebuilds_only_the_changed_module() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/index.js", "require('./dep');\n");
        write(root, "src/dep.js", "module.exports = 1;\n");

        let lines = sink();
        let mut adapter = ModuleGraphAdapter::new(root, "main.js", &[], false);
        adapter.bundle(&["src/index.js".into()], &lines).await.unwrap();

        write(root, "src/dep.js", "module.exports = 2;\n");
        assert!(adapter.invalidate(&root.join("src/dep.js")));
        let out = adapter.bundle(&["src/index.js".into()], &lines).await.unwrap();

        assert_eq!(out.modules_rebuilt, 1);
        assert!(String::from_utf8(out.code).unwrap().contains("module.exports = 2;"));
        assert_eq!(lines.0.lock().unwrap().len(), 2);
        assert!(!adapter.invalidate(&root.join("src/unrelated.js")));
    }

    #[tokio::test]
    async fn reset_rereads_every_module() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/index.js", "require('./dep');\n");
        write(root, "src/dep.js", "module.exports = 1;\n");

        let lines = sink();
        let mut adapter = ModuleGraphAdapter::new(root, "main.js", &[], false);
        adapter.bundle(&["src/index.js".into()], &lines).await.unwrap();

        write(root, "src/dep.js", "module.exports = 2;\n");
        adapter.reset();
        assert_eq!(adapter.cached_modules(), 0);
        let out = adapter.bundle(&["src/index.js".into()], &lines).await.unwrap();

        assert_eq!(out.modules_rebuilt, 2);
        assert!(String::from_utf8(out.code).unwrap().contains("module.exports = 2;"));
    }

    #[tokio::test]
    async fn missing_module_names_the_requiring_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/index.js", "require('./missing');\n");

        let mut adapter = ModuleGraphAdapter::new(root, "main.js", &[], false);
        let err = adapter.bundle(&["src/index.js".into()], &sink()).await.unwrap_err();

        match err {
            KilnError::Transform { file, message } => {
                assert_eq!(file, "src/index.js");
                assert!(message.contains("./missing"));
            }
            other => panic!("expected Transform error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_entry_is_transform_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = ModuleGraphAdapter::new(dir.path(), "main.js", &[], false);
        let err = adapter.bundle(&["nope.js".into()], &sink()).await.unwrap_err();
        assert_eq!(err.kind(), "transform");
    }

    #[tokio::test]
    async fn multiple_entries_run_in_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "sw/index.js", "require('./shared');\n");
        write(root, "sw/preroll/index.js", "require('../shared');\n");
        write(root, "sw/shared.js", "module.exports = {};\n");

        let mut adapter = ModuleGraphAdapter::new(root, "sw.js", &[], false);
        let out = adapter
            .bundle(&["sw/index.js".into(), "sw/preroll/index.js".into()], &sink())
            .await
            .unwrap();

        assert_eq!(out.modules_total, 3);
        let code = String::from_utf8(out.code).unwrap();
        assert!(code.trim_end().ends_with("}, [0, 2]);"));
    }

    #[tokio::test]
    async fn templates_and_json_are_bundled_as_modules() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "src/index.js",
            "var t = require('./post.hbs');\nvar c = require('./config');\n",
        );
        write(root, "src/post.hbs", "<h1>{{title}}</h1>");
        write(root, "src/config.json", "{\"debug\": true}");

        let mut adapter = ModuleGraphAdapter::new(
            root,
            "main.js",
            &[TransformConfig::Template {
                extensions: vec!["hbs".into()],
            }],
            true,
        );
        let out = adapter.bundle(&["src/index.js".into()], &sink()).await.unwrap();
        let code = String::from_utf8(out.code).unwrap();

        assert!(code.contains("module.exports = \"<h1>{{title}}</h1>\";"));
        assert!(code.contains("module.exports = {\"debug\":true};"));

        let map: serde_json::Value = serde_json::from_str(&out.sourcemap.unwrap()).unwrap();
        assert_eq!(map["file"], "main.js");
        assert_eq!(map["sources"][0], "src/index.js");
        assert_eq!(map["sources"].as_array().unwrap().len(), 3);
    }
}
