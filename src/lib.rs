/* Copyright (c) 2026 the airspeed developers. This Source Code Form is subject to the terms of the Eclipse Public License, v. 2.0. */
//! Airspeed: a Velocity Template Language (VTL) subset implementation.
//!
//! This crate exposes a template compiler and evaluator: VTL source is
//! parsed once into an immutable [`Template`], which can then be merged any
//! number of times (concurrently, if desired) against a caller-supplied
//! context.
//!
//! # Examples
//! ```
//! use airspeed::{Template, Value};
//!
//! let template = Template::new("Hello $name!")?;
//! let context = Value::map([("name", "world")]);
//! assert_eq!(template.merge(&context, None)?, "Hello world!");
//! # Ok::<(), airspeed::TemplateError>(())
//! ```
//!
//! Templates that `#include` or `#parse` other templates resolve them
//! through a [`Loader`]; [`CachingFileLoader`] serves a directory tree and
//! caches parsed templates with freshness checks.

mod ast;
mod error;
mod eval;
mod namespace;
mod parser;

pub mod loader;
pub mod value;

use std::fmt;

pub use error::{TemplateError, TemplateResult};
pub use loader::{CachingFileLoader, DictLoader, Loader, NullLoader};
pub use value::{HostObject, HostResult, MacroValue, Range, Value};

/// Behaviour switches recognized by the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOptions {
    /// When set, an undefined non-quiet reference raises a
    /// [`TemplateError::Execution`] instead of rendering as its source text.
    pub strict_references: bool,
    /// When set, arithmetic on null and comparison across unlike kinds
    /// raise instead of treating null as zero / comparing as false.
    pub strict_math: bool,
}

/// A parsed template: an immutable AST plus the options it was built with.
/// Safe to render concurrently; each merge gets its own namespace and sink.
pub struct Template {
    name: Option<String>,
    pub(crate) root: ast::Block,
    pub(crate) options: RenderOptions,
}

impl Template {
    pub fn new(source: &str) -> TemplateResult<Template> {
        Self::with_options(source, None, RenderOptions::default())
    }

    pub fn with_name(source: &str, name: &str) -> TemplateResult<Template> {
        Self::with_options(source, Some(name), RenderOptions::default())
    }

    pub fn with_options(
        source: &str,
        name: Option<&str>,
        options: RenderOptions,
    ) -> TemplateResult<Template> {
        let root = parser::parse(source, name.unwrap_or("<string>"))?;
        Ok(Template {
            name: name.map(str::to_string),
            root,
            options,
        })
    }

    /// Source name used in error messages and as the loader cache key.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<string>")
    }

    /// Renders against `context` and returns the output. The context is any
    /// mapping-shaped [`Value`]; it is copied into the render's namespace,
    /// so the caller's data is never mutated except through host-object
    /// method calls.
    pub fn merge(&self, context: &Value, loader: Option<&dyn Loader>) -> TemplateResult<String> {
        let mut out = String::new();
        self.merge_to(&mut out, context, loader)?;
        Ok(out)
    }

    /// Streaming variant of [`merge`](Template::merge): writes to `out` as
    /// rendering proceeds.
    pub fn merge_to(
        &self,
        out: &mut dyn fmt::Write,
        context: &Value,
        loader: Option<&dyn Loader>,
    ) -> TemplateResult<()> {
        eval::render(self, context, loader.unwrap_or(&NullLoader), out)
    }
}

/// One-shot convenience: parse and merge in a single call.
pub fn render(source: &str, context: &Value) -> TemplateResult<String> {
    Template::new(source)?.merge(context, None)
}
