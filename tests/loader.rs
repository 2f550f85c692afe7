use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use airspeed::{CachingFileLoader, Loader, Template, TemplateError, Value};

fn empty() -> Value {
    Value::Map(Vec::new())
}

fn write_template(dir: &std::path::Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).expect("write template");
}

/// Pushes the file's modified stamp forward so freshness checks observe a
/// change even on filesystems with coarse timestamps.
fn bump_mtime(dir: &std::path::Path, name: &str) {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(dir.join(name))
        .expect("open template");
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .expect("set mtime");
}

#[test]
fn load_text_returns_raw_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "raw.vm", "plain $x");
    let loader = CachingFileLoader::new(dir.path());
    assert_eq!(loader.load_text("raw.vm").expect("load"), "plain $x");
}

#[test]
fn load_template_parses_and_caches() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "t.vm", "Hello $name!");
    let loader = CachingFileLoader::new(dir.path());

    let first = loader.load_template("t.vm").expect("load");
    let second = loader.load_template("t.vm").expect("load");
    assert!(Arc::ptr_eq(&first, &second), "cache should return the same parse");

    let rendered = first
        .merge(&Value::map([("name", "world")]), None)
        .expect("merge");
    assert_eq!(rendered, "Hello world!");
}

#[test]
fn modified_sources_are_reparsed() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "t.vm", "one");
    let loader = CachingFileLoader::new(dir.path());

    let before = loader.load_template("t.vm").expect("load");
    assert_eq!(before.merge(&empty(), None).expect("merge"), "one");

    write_template(dir.path(), "t.vm", "two");
    bump_mtime(dir.path(), "t.vm");

    let after = loader.load_template("t.vm").expect("load");
    assert!(!Arc::ptr_eq(&before, &after), "stale entry must be reparsed");
    assert_eq!(after.merge(&empty(), None).expect("merge"), "two");

    let again = loader.load_template("t.vm").expect("load");
    assert!(Arc::ptr_eq(&after, &again));
}

#[test]
fn concurrent_lookups_share_one_parse() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "t.vm", "Hello $name!");
    let loader = Arc::new(CachingFileLoader::new(dir.path()));

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for _ in 0..threads {
        let loader = loader.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            loader.load_template("t.vm").expect("load")
        }));
    }
    let templates: Vec<Arc<Template>> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();
    for template in &templates[1..] {
        assert!(Arc::ptr_eq(&templates[0], template), "lookups must coalesce");
    }
}

#[test]
fn syntax_errors_are_broadcast_to_all_waiters() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "bad.vm", "#foreach($a in $b)unterminated");
    let loader = Arc::new(CachingFileLoader::new(dir.path()));

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let loader = loader.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            loader.load_template("bad.vm")
        }));
    }
    for handle in handles {
        let outcome = handle.join().expect("thread");
        assert!(matches!(outcome, Err(TemplateError::Syntax { .. })));
    }
}

#[test]
fn missing_templates_are_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let loader = CachingFileLoader::new(dir.path());
    assert!(matches!(
        loader.load_template("nope.vm"),
        Err(TemplateError::NotFound(_))
    ));
    assert!(matches!(
        loader.load_text("nope.vm"),
        Err(TemplateError::NotFound(_))
    ));
}

#[test]
fn names_escaping_the_root_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "ok.vm", "fine");
    let loader = CachingFileLoader::new(dir.path());

    for name in ["../secret", "/etc/passwd", "a/../b", "..", "a\\b", ""] {
        assert!(
            matches!(loader.load_text(name), Err(TemplateError::NotFound(_))),
            "{name} should be rejected"
        );
    }
    assert_eq!(loader.load_text("ok.vm").expect("load"), "fine");
}

#[test]
fn bounded_caches_evict_old_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "a.vm", "A");
    write_template(dir.path(), "b.vm", "B");
    let loader = CachingFileLoader::new(dir.path()).cache_size(1);

    let a_first = loader.load_template("a.vm").expect("load");
    loader.load_template("b.vm").expect("load");
    let a_second = loader.load_template("a.vm").expect("load");
    assert!(
        !Arc::ptr_eq(&a_first, &a_second),
        "evicted entries are parsed again"
    );
}

#[test]
fn file_loader_serves_parse_and_include() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_template(dir.path(), "outer.vm", "[#parse(\"inner.vm\")][#include(\"inner.vm\")]");
    write_template(dir.path(), "inner.vm", "$greeting");
    let loader = CachingFileLoader::new(dir.path());

    let outer = loader.load_template("outer.vm").expect("load");
    let rendered = outer
        .merge(&Value::map([("greeting", "hi")]), Some(&loader))
        .expect("merge");
    assert_eq!(rendered, "[hi][$greeting]");
}

#[test]
fn one_template_renders_concurrently() {
    let template = Arc::new(
        Template::new("#foreach($i in [1..3])$who-$i;#end").expect("parse"),
    );
    let mut handles = Vec::new();
    for who in ["a", "b", "c"] {
        let template = template.clone();
        handles.push(thread::spawn(move || {
            template
                .merge(&Value::map([("who", who)]), None)
                .expect("merge")
        }));
    }
    let outputs: Vec<String> = handles.into_iter().map(|h| h.join().expect("thread")).collect();
    assert_eq!(outputs[0], "a-1;a-2;a-3;");
    assert_eq!(outputs[1], "b-1;b-2;b-3;");
    assert_eq!(outputs[2], "c-1;c-2;c-3;");
}

#[test]
fn merge_to_streams_into_the_sink() {
    let template = Template::new("Hello $name!").expect("parse");
    let mut out = String::new();
    template
        .merge_to(&mut out, &Value::map([("name", "Chris")]), None)
        .expect("merge_to");
    assert_eq!(out, "Hello Chris!");
}
