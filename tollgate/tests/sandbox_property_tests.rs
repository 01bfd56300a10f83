//! Sandbox property tests: randomized paths checked against a simple model.
//!
//! A path is writable iff it has no `.`/`..` segments, resolves strictly
//! inside the sandbox root, and ends in an allowed extension.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use tollgate::{GateConfig, SandboxValidator};

/// xorshift64*, fixed seed so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[(self.next() % items.len() as u64) as usize]
    }
}

const SEGMENTS: &[&str] = &[
    "sub", "out", "in", "a.draft", "b.json", "c.txt", "D.JSON", "..", ".", "deep",
];

struct Fixture {
    _dir: tempfile::TempDir,
    outside: PathBuf,
    validator: SandboxValidator,
}

/// Sandbox with `sub/`, `out -> <outside>` and `in -> sub`.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let outside = root.join("outside");
    fs::create_dir_all(&outside).unwrap();

    let config = GateConfig::for_workspace(root.join("ws"));
    let validator = SandboxValidator::new(&config).unwrap();
    let sandbox = validator.sandbox_root().to_path_buf();
    fs::create_dir_all(sandbox.join("sub")).unwrap();
    std::os::unix::fs::symlink(&outside, sandbox.join("out")).unwrap();
    std::os::unix::fs::symlink(sandbox.join("sub"), sandbox.join("in")).unwrap();

    Fixture {
        _dir: dir,
        outside,
        validator,
    }
}

fn expected_allowed(segments: &[&str], absolute_outside: bool) -> bool {
    if absolute_outside || segments.is_empty() {
        return false;
    }
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return false;
    }
    // `out` only escapes at the sandbox root; deeper it is a plain name.
    if segments[0] == "out" {
        return false;
    }
    let last = segments[segments.len() - 1];
    let ext = Path::new(last)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    matches!(ext.as_deref(), Some("draft") | Some("json"))
}

#[test]
fn prop_validate_write_matches_model() {
    let fx = fixture();
    let sandbox = fx.validator.sandbox_root().to_path_buf();
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);

    for _ in 0..2000 {
        let len = (rng.next() % 5) as usize;
        let segments: Vec<&str> = (0..len).map(|_| rng.pick(SEGMENTS)).collect();
        let relative = segments.join("/");

        let form = rng.next() % 3;
        let (path, absolute_outside) = match form {
            0 => (PathBuf::from(&relative), false),
            1 => (sandbox.join(&relative), false),
            _ => (fx.outside.join(&relative), true),
        };

        let allowed = fx.validator.validate_write(&path).is_allowed();
        assert_eq!(
            allowed,
            expected_allowed(&segments, absolute_outside),
            "path {}",
            path.display()
        );
    }
}

#[test]
fn prop_resolved_write_path_stays_inside() {
    let fx = fixture();
    let sandbox = fx.validator.sandbox_root().to_path_buf();
    let mut rng = Rng(42);

    for _ in 0..500 {
        let len = 1 + (rng.next() % 4) as usize;
        let relative: Vec<&str> = (0..len).map(|_| rng.pick(SEGMENTS)).collect();
        if let tollgate::PathCheck::Allowed(resolved) =
            fx.validator.validate_write(Path::new(&relative.join("/")))
        {
            assert!(resolved.starts_with(&sandbox) && resolved != sandbox);
        }
    }
}
