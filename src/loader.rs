use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::{debug, trace};

use crate::error::{TemplateError, TemplateResult};
use crate::{RenderOptions, Template};

/// Resolves `#include`/`#parse` targets to sources and parsed templates.
///
/// `load_text` returns raw bytes for `#include`; `load_template` returns a
/// parsed (and typically cached) template for `#parse`.
pub trait Loader: Send + Sync {
    fn load_text(&self, name: &str) -> TemplateResult<String>;

    fn load_template(&self, name: &str) -> TemplateResult<Arc<Template>>;
}

/// Fails every lookup. The default when a template makes no `#include` or
/// `#parse` references.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLoader;

impl Loader for NullLoader {
    fn load_text(&self, name: &str) -> TemplateResult<String> {
        Err(TemplateError::NotFound(name.to_string()))
    }

    fn load_template(&self, name: &str) -> TemplateResult<Arc<Template>> {
        Err(TemplateError::NotFound(name.to_string()))
    }
}

/// In-memory name → source map; parses on demand. The hermetic loader for
/// tests and embedded template sets.
#[derive(Clone, Debug, Default)]
pub struct DictLoader {
    entries: HashMap<String, String>,
    options: RenderOptions,
}

impl DictLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RenderOptions) -> Self {
        Self {
            entries: HashMap::new(),
            options,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.entries.insert(name.into(), source.into());
    }
}

impl Loader for DictLoader {
    fn load_text(&self, name: &str) -> TemplateResult<String> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    fn load_template(&self, name: &str) -> TemplateResult<Arc<Template>> {
        let source = self.load_text(name)?;
        let template = Template::with_options(&source, Some(name), self.options)?;
        Ok(Arc::new(template))
    }
}

type ParseOutcome = Result<(Arc<Template>, SystemTime), TemplateError>;

/// In-progress parse that concurrent lookups of the same key attach to.
/// The leader publishes exactly one outcome; every waiter receives it
/// verbatim.
struct Flight {
    done: Mutex<Option<ParseOutcome>>,
    cond: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            done: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, outcome: ParseOutcome) {
        let mut done = lock(&self.done);
        *done = Some(outcome);
        self.cond.notify_all();
    }

    fn wait(&self) -> ParseOutcome {
        let mut done = lock(&self.done);
        loop {
            match &*done {
                Some(outcome) => return outcome.clone(),
                None => done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner()),
            }
        }
    }
}

enum Slot {
    InFlight(Arc<Flight>),
    Ready {
        template: Arc<Template>,
        modified: SystemTime,
    },
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    /// Insertion order, for eviction when a size bound is set.
    order: Vec<String>,
}

/// File-system loader rooted at a directory, caching parsed templates keyed
/// by name with last-modified freshness checks.
///
/// Names are confined to the root: absolute paths, `..`/`.` segments, and
/// backslash separators are rejected.
pub struct CachingFileLoader {
    root: PathBuf,
    options: RenderOptions,
    cache_size: Option<usize>,
    state: Mutex<CacheState>,
}

impl CachingFileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_options(root, RenderOptions::default())
    }

    pub fn with_options(root: impl Into<PathBuf>, options: RenderOptions) -> Self {
        Self {
            root: root.into(),
            options,
            cache_size: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Bounds the number of cached templates; oldest entries are evicted
    /// first. Unbounded by default.
    pub fn cache_size(mut self, limit: usize) -> Self {
        self.cache_size = Some(limit);
        self
    }

    fn resolve(&self, name: &str) -> TemplateResult<PathBuf> {
        let relative = safe_template_name(name)
            .map_err(|reason| TemplateError::NotFound(format!("{} ({})", name, reason)))?;
        Ok(self.root.join(relative))
    }

    fn read(&self, name: &str, path: &Path) -> TemplateResult<String> {
        fs::read_to_string(path).map_err(|e| io_error(name, &e))
    }

    fn modified(&self, name: &str, path: &Path) -> TemplateResult<SystemTime> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| io_error(name, &e))
    }

    fn parse(&self, name: &str, path: &Path, modified: SystemTime) -> ParseOutcome {
        debug!(name, "parsing template");
        let source = self.read(name, path)?;
        let template = Template::with_options(&source, Some(name), self.options)?;
        Ok((Arc::new(template), modified))
    }

    fn evict_over_limit(&self, state: &mut CacheState) {
        let Some(limit) = self.cache_size else { return };
        let mut idx = 0;
        while state.entries.len() > limit && idx < state.order.len() {
            // In-flight entries are skipped; their waiters still need them.
            if matches!(
                state.entries.get(&state.order[idx]),
                Some(Slot::Ready { .. })
            ) {
                let oldest = state.order.remove(idx);
                state.entries.remove(&oldest);
            } else {
                idx += 1;
            }
        }
    }
}

impl Loader for CachingFileLoader {
    fn load_text(&self, name: &str) -> TemplateResult<String> {
        let path = self.resolve(name)?;
        self.read(name, &path)
    }

    fn load_template(&self, name: &str) -> TemplateResult<Arc<Template>> {
        let path = self.resolve(name)?;
        let modified = self.modified(name, &path)?;

        let flight = {
            let mut state = lock(&self.state);
            match state.entries.get(name) {
                Some(Slot::Ready {
                    template,
                    modified: cached,
                }) if *cached == modified => {
                    trace!(name, "template cache hit");
                    return Ok(template.clone());
                }
                Some(Slot::InFlight(flight)) => flight.clone(),
                _ => {
                    // Stale or absent: this caller parses; others coalesce.
                    let flight = Arc::new(Flight::new());
                    if state
                        .entries
                        .insert(name.to_string(), Slot::InFlight(flight.clone()))
                        .is_none()
                    {
                        state.order.push(name.to_string());
                    }
                    drop(state);

                    let outcome = self.parse(name, &path, modified);
                    let mut state = lock(&self.state);
                    match &outcome {
                        Ok((template, modified)) => {
                            state.entries.insert(
                                name.to_string(),
                                Slot::Ready {
                                    template: template.clone(),
                                    modified: *modified,
                                },
                            );
                            self.evict_over_limit(&mut state);
                        }
                        Err(_) => {
                            state.entries.remove(name);
                            state.order.retain(|n| n != name);
                        }
                    }
                    drop(state);

                    flight.publish(outcome.clone());
                    return outcome.map(|(template, _)| template);
                }
            }
        };

        flight.wait().map(|(template, _)| template)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn io_error(name: &str, error: &io::Error) -> TemplateError {
    if error.kind() == io::ErrorKind::NotFound {
        TemplateError::NotFound(name.to_string())
    } else {
        TemplateError::Io {
            name: name.to_string(),
            message: error.to_string(),
        }
    }
}

/// Accepts only plain relative paths: no backslashes, no absolute paths,
/// no `..` or `.` segments.
fn safe_template_name(name: &str) -> Result<&Path, &'static str> {
    if name.contains('\\') {
        return Err("backslash separators are not allowed");
    }
    let relative = Path::new(name);
    if relative.is_absolute() {
        return Err("absolute paths are not allowed");
    }
    let mut has_normal_segment = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_normal_segment = true,
            _ => return Err("path escapes the template root"),
        }
    }
    if !has_normal_segment {
        return Err("empty template name");
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::safe_template_name;

    #[test]
    fn safe_template_name_accepts_nested_relative_paths() {
        let path = safe_template_name("layouts/base.vm").expect("accepted");
        assert_eq!(path.as_os_str(), "layouts/base.vm");
    }

    #[test]
    fn safe_template_name_rejects_traversal() {
        assert!(safe_template_name("../secrets.vm").is_err());
        assert!(safe_template_name("a/../b.vm").is_err());
        assert!(safe_template_name("/etc/passwd").is_err());
        assert!(safe_template_name("a\\b.vm").is_err());
        assert!(safe_template_name("").is_err());
    }
}
