//! Randomised checks against small reference models.

use quill::{Interpreter, Value};

const CASES: usize = 200;

/// Random integer expression over small literals, with its expected value.
/// Operands stay small enough that no intermediate overflows.
fn expression(rng: &mut fastrand::Rng, depth: u32) -> (String, i64) {
    if depth == 0 || rng.u8(0..4) == 0 {
        let n = rng.i64(-20..=20);
        return if n < 0 { (format!("({n})"), n) } else { (n.to_string(), n) };
    }
    let (ls, l) = expression(rng, depth - 1);
    let (rs, r) = expression(rng, depth - 1);
    match rng.u8(0..5) {
        0 => (format!("({ls} + {rs})"), l + r),
        1 => (format!("({ls} - {rs})"), l - r),
        2 => (format!("({ls} * {rs})"), l * r),
        3 if r != 0 => (format!("({ls} / {rs})"), l / r),
        4 if r != 0 => (format!("({ls} % {rs})"), l % r),
        _ => (format!("({ls} + {rs})"), l + r),
    }
}

#[test]
fn integer_arithmetic_matches_reference() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut interp = Interpreter::new();
    for _ in 0..CASES {
        let (src, expected) = expression(&mut rng, 3);
        let got = interp.run(&format!("{src};"), "expr.ql").unwrap();
        assert_eq!(got.as_int(), Some(expected), "source: {src}");
    }
}

#[test]
fn comparisons_match_reference() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut interp = Interpreter::new();
    for _ in 0..CASES {
        let a = rng.i64(-50..50);
        let b = rng.i64(-50..50);
        let src = format!("[{a} < {b}, {a} <= {b}, {a} == {b}, {a} != {b}, {a} > {b}, {a} >= {b}];");
        let got = format!("{:?}", interp.run(&src, "cmp.ql").unwrap());
        let expected = format!("[{}, {}, {}, {}, {}, {}]", a < b, a <= b, a == b, a != b, a > b, a >= b);
        assert_eq!(got, expected, "source: {src}");
    }
}

#[test]
fn list_writes_read_back() {
    let mut rng = fastrand::Rng::with_seed(42);
    let mut interp = Interpreter::new();
    interp.run("let xs = [0, 0, 0, 0, 0, 0, 0, 0];", "list.ql").unwrap();
    let mut model = [0i64; 8];
    for _ in 0..CASES {
        let i = rng.usize(0..8);
        let v = rng.i64(-1000..1000);
        model[i] = v;
        // Negative indices count from the end.
        let index = if rng.bool() { i as i64 } else { i as i64 - 8 };
        interp.run(&format!("xs[{index}] = {v};"), "list.ql").unwrap();
        let read = interp.run(&format!("[xs[{index}], len(xs)];"), "list.ql").unwrap();
        assert_eq!(format!("{read:?}"), format!("[{v}, 8]"));
    }
    let all = interp.resolve("xs").unwrap();
    let expected: Vec<String> = model.iter().map(i64::to_string).collect();
    assert_eq!(format!("{all:?}"), format!("[{}]", expected.join(", ")));
}

#[test]
fn map_writes_read_back() {
    let mut rng = fastrand::Rng::with_seed(99);
    let mut interp = Interpreter::new();
    interp.run("let m = {};", "map.ql").unwrap();
    let mut model: Vec<(String, i64)> = Vec::new();
    for _ in 0..CASES {
        let key = format!("k{}", rng.u8(0..12));
        let v = rng.i64(0..500);
        match model.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = v,
            None => model.push((key.clone(), v)),
        }
        interp.run(&format!("m[\"{key}\"] = {v};"), "map.ql").unwrap();
        let read = interp.run(&format!("m.{key};"), "map.ql").unwrap();
        assert_eq!(read, Value::int(v));
    }
    let len = interp.run("len(m);", "map.ql").unwrap();
    assert_eq!(len.as_int(), Some(model.len() as i64));
    // Iteration follows insertion order.
    let keys = interp.run("let ks = []; for (k in m) { append(ks, k); } ks;", "map.ql").unwrap();
    let expected: Vec<String> = model.iter().map(|(k, _)| format!("{k:?}")).collect();
    assert_eq!(format!("{keys:?}"), format!("[{}]", expected.join(", ")));
}

#[test]
fn string_slices_match_char_slices() {
    let mut rng = fastrand::Rng::with_seed(3);
    let mut interp = Interpreter::new();
    let text = "añb€cd🦀e";
    let chars: Vec<char> = text.chars().collect();
    interp.run(&format!("let s = \"{text}\";"), "str.ql").unwrap();
    for _ in 0..CASES {
        let a = rng.usize(0..=chars.len());
        let b = rng.usize(a..=chars.len());
        let got = interp.run(&format!("s[{a}:{b}];"), "str.ql").unwrap();
        let expected: String = chars[a..b].iter().collect();
        assert_eq!(format!("{got}"), expected, "slice {a}:{b}");
    }
}
