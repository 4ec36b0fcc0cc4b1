use std::fs;
use std::path::{Path, PathBuf};

use quill::artifact::{self, ModuleImage};
use quill::{Error, Interpreter, Options, SharedOutput};

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn interpreter(search_path: &Path) -> (Interpreter, SharedOutput) {
    let options = Options { search_path: search_path.to_string_lossy().into_owned(), ..Options::default() };
    let out = SharedOutput::new();
    (Interpreter::with_options(options).with_output(out.clone()), out)
}

#[test]
fn source_module_exports_its_definitions() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "geometry.ql",
        "let pi = 3.5;\nlet area = fun(r) { return pi * r * r; };\nfun perimeter(r) { return 2 * pi * r; }\n",
    );
    let main = write(dir.path(), "main.ql", "let g = require(\"geometry\");\n[g.area(2), g.perimeter(1), g.pi];");
    let (mut interp, _) = interpreter(dir.path());
    let v = interp.run_file(&main).unwrap();
    assert_eq!(format!("{v:?}"), "[14.0, 7.0, 3.5]");
}

#[test]
fn modules_resolve_from_the_search_path() {
    let lib = tempfile::tempdir().unwrap();
    let app = tempfile::tempdir().unwrap();
    write(lib.path(), "strings.ql", "let shout = fun(s) { return s + \"!\"; };\n");
    let main = write(app.path(), "main.ql", "require(\"strings\").shout(\"hey\");");
    let (mut interp, _) = interpreter(lib.path());
    assert_eq!(format!("{:?}", interp.run_file(&main).unwrap()), "\"hey!\"");
}

#[test]
fn search_path_option_in_source() {
    let lib = tempfile::tempdir().unwrap();
    let app = tempfile::tempdir().unwrap();
    write(lib.path(), "answer.ql", "let value = 42;\n");
    let source = format!(
        "#![SEARCH_PATH({:?})]\nrequire(\"answer\").value;",
        lib.path().to_string_lossy()
    );
    let main = write(app.path(), "main.ql", &source);
    let mut interp = Interpreter::with_options(Options { search_path: String::new(), ..Options::default() });
    assert_eq!(interp.run_file(&main).unwrap().as_int(), Some(42));
}

#[test]
fn nested_requires_share_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "state.ql", "println(\"init state\");\nlet items = [];\n");
    write(
        dir.path(),
        "writer.ql",
        "let state = require(\"state\");\nlet add = fun(x) { append(state.items, x); };\n",
    );
    let main = write(
        dir.path(),
        "main.ql",
        "let w = require(\"writer\");\nlet s = require(\"state\");\nw.add(1);\nw.add(2);\ns.items;",
    );
    let (mut interp, out) = interpreter(dir.path());
    let v = interp.run_file(&main).unwrap();
    assert_eq!(format!("{v:?}"), "[1, 2]");
    assert_eq!(out.contents(), "init state\n");
}

#[test]
fn cyclic_requires_terminate() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "ping.ql", "let other = require(\"pong\");\nlet name = \"ping\";\n");
    write(dir.path(), "pong.ql", "let other = require(\"ping\");\nlet name = \"pong\";\n");
    let main = write(dir.path(), "main.ql", "let p = require(\"ping\");\n[p.name, p.other.name, p.other.other];");
    let (mut interp, _) = interpreter(dir.path());
    let v = interp.run_file(&main).unwrap();
    assert_eq!(format!("{v:?}"), "[\"ping\", \"pong\", null]");
}

#[test]
fn syntax_errors_point_into_the_module() {
    let dir = tempfile::tempdir().unwrap();
    let broken = write(dir.path(), "broken.ql", "let ok = 1;\nlet = 2;\n");
    let main = write(dir.path(), "main.ql", "require(\"broken\");");
    let (mut interp, _) = interpreter(dir.path());
    match interp.run_file(&main) {
        Err(Error::Compile(e)) => {
            assert_eq!(e.code, "QL-C001");
            assert_eq!(e.line, 2);
            let expected = broken.canonicalize().unwrap();
            assert_eq!(Path::new(&e.filename), expected);
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    // The failed compile leaves the interpreter usable.
    assert_eq!(interp.run("1 + 1;", "after.ql").unwrap().as_int(), Some(2));
}

#[test]
fn prebuilt_module_is_loaded_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let source = "println(\"body runs\");\nlet twice = fun(x) { return x * 2; };\nlet label = \"built\";\n";
    let image = artifact::build(source, "doubler.ql").unwrap();
    image.write(&dir.path().join("doubler.qlc")).unwrap();

    let main = write(
        dir.path(),
        "main.ql",
        "let a = require(\"doubler\");\nlet b = require(\"doubler\");\n[a.twice(21), b.label];",
    );
    let (mut interp, out) = interpreter(dir.path());
    let v = interp.run_file(&main).unwrap();
    assert_eq!(format!("{v:?}"), "[42, \"built\"]");
    assert_eq!(out.contents(), "body runs\n");

    // A second program in the same interpreter reuses the cached exports.
    let again = write(dir.path(), "again.ql", "require(\"doubler\").twice(5);");
    assert_eq!(interp.run_file(&again).unwrap().as_int(), Some(10));
    assert_eq!(out.contents(), "body runs\n");
}

#[test]
fn source_is_preferred_over_prebuilt() {
    let dir = tempfile::tempdir().unwrap();
    artifact::build("let which = \"image\";", "m.ql").unwrap().write(&dir.path().join("m.qlc")).unwrap();
    write(dir.path(), "m.ql", "let which = \"source\";\n");
    let main = write(dir.path(), "main.ql", "require(\"m\").which;");
    let (mut interp, _) = interpreter(dir.path());
    assert_eq!(format!("{:?}", interp.run_file(&main).unwrap()), "\"source\"");
}

#[test]
fn image_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calc.qlc");
    let image = artifact::build("let big = 1000000;\nlet f = fun(n) { return n + big + 0.25; };\n", "calc.ql").unwrap();
    image.write(&path).unwrap();
    let read = ModuleImage::read(&path).unwrap();
    assert_eq!(read.constants, image.constants);
    assert_eq!(read.functions.len(), image.functions.len());
    assert_eq!(read.entry, image.entry);
}

#[test]
fn broken_images_fail_at_run_time() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "bad.qlc", "{ not json");
    let main = write(dir.path(), "main.ql", "require(\"bad\");");
    let (mut interp, _) = interpreter(dir.path());
    match interp.run_file(&main) {
        Err(Error::Runtime(e)) => {
            assert_eq!(e.code, "QL-R012");
            assert!(e.message().contains("bad.qlc"));
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
}
