//! Command memoisation through the on-disk cache, across separate
//! build invocations sharing one cache directory.

use std::fs;
use std::path::Path;

use don::{BuildOptions, CollectOutput, run_build};
use pretty_assertions::assert_eq;

fn build_in(dir: &Path, script: &str) -> CollectOutput {
    let path = dir.join("build.don");
    fs::write(&path, script).unwrap();
    let options = BuildOptions {
        script: path,
        cache_dir: Some(dir.join("cache")),
        disassemble: false,
    };
    let mut out = CollectOutput::new();
    run_build(&options, &[], &mut out).unwrap_or_else(|e| panic!("build failed: {e}"));
    out
}

#[test]
fn exec_is_cached_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let marker_str = marker.to_str().unwrap();
    // The command appends to a marker file so a replay is observable:
    // a cache hit must echo the recorded stdout without spawning.
    let script = format!(
        "default:\n  exec([\"sh\", \"-c\", \"echo ran >> {marker_str}; echo built\"])\n"
    );

    let out = build_in(dir.path(), &script);
    assert_eq!(out.stdout(), "built\n");
    assert_eq!(fs::read_to_string(&marker).unwrap(), "ran\n");

    // Second run: same digest, no dependencies, so the command must not
    // run again while its output is still echoed.
    let out = build_in(dir.path(), &script);
    assert_eq!(out.stdout(), "built\n");
    assert_eq!(fs::read_to_string(&marker).unwrap(), "ran\n");

    // The artifact directory exists under the two-level digest layout.
    let cache_dir = dir.path().join("cache");
    let subdir = fs::read_dir(&cache_dir)
        .unwrap()
        .filter_map(Result::ok)
        .find(|e| e.path().is_dir() && e.file_name().len() == 2)
        .expect("artifact subdirectory");
    let artifact = fs::read_dir(subdir.path())
        .unwrap()
        .filter_map(Result::ok)
        .next()
        .expect("artifact directory");
    assert_eq!(artifact.file_name().len(), 46);
}

#[test]
fn different_commands_have_different_digests() {
    let dir = tempfile::tempdir().unwrap();
    let out = build_in(dir.path(), "default:\n  exec([\"echo\", \"one\"])\n");
    assert_eq!(out.stdout(), "one\n");
    let out = build_in(dir.path(), "default:\n  exec([\"echo\", \"two\"])\n");
    assert_eq!(out.stdout(), "two\n");
    // And the first command still replays from cache.
    let out = build_in(dir.path(), "default:\n  exec([\"echo\", \"one\"])\n");
    assert_eq!(out.stdout(), "one\n");
}

#[test]
fn env_overrides_are_part_of_the_digest() {
    let dir = tempfile::tempdir().unwrap();
    let script_a = "default:\n  exec([\"sh\", \"-c\", \"echo $V\"], env=[\"V\", \"a\"])\n";
    let script_b = "default:\n  exec([\"sh\", \"-c\", \"echo $V\"], env=[\"V\", \"b\"])\n";
    assert_eq!(build_in(dir.path(), script_a).stdout(), "a\n");
    assert_eq!(build_in(dir.path(), script_b).stdout(), "b\n");
    assert_eq!(build_in(dir.path(), script_a).stdout(), "a\n");
}

#[test]
fn uncached_exec_runs_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let marker_str = marker.to_str().unwrap();
    let script = format!(
        "default:\n  exec([\"sh\", \"-c\", \"echo ran >> {marker_str}\"], echo=false, cache=false)\n"
    );
    build_in(dir.path(), &script);
    build_in(dir.path(), &script);
    assert_eq!(fs::read_to_string(&marker).unwrap(), "ran\nran\n");
}

#[test]
fn failing_command_halts_and_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("build.don");
    fs::write(&path, "default:\n  exec([\"sh\", \"-c\", \"exit 9\"])\n").unwrap();
    let options = BuildOptions {
        script: path,
        cache_dir: Some(dir.path().join("cache")),
        disassemble: false,
    };
    let mut out = CollectOutput::new();
    let result = run_build(&options, &[], &mut out);
    match result {
        Err(don::BuildError::Failed(messages)) => {
            assert!(messages[0].contains("failed with status 9"), "got {:?}", messages[0]);
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[test]
fn non_failing_status_is_returned_to_the_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = concat!(
        "default:\n",
        "  status = exec([\"sh\", \"-c\", \"exit 4\"], fail=false, cache=false)\n",
        "  echo(status)\n",
    );
    let out = build_in(dir.path(), script);
    assert_eq!(out.stdout(), "4\n");
}

#[test]
fn branch_on_command_status_runs_one_arm() {
    let dir = tempfile::tempdir().unwrap();
    let script = concat!(
        "default:\n",
        "  status = exec([\"true\"], cache=false)\n",
        "  if status == 0\n",
        "    echo(\"clean\")\n",
        "  else\n",
        "    echo(\"dirty\")\n",
    );
    let out = build_in(dir.path(), script);
    assert_eq!(out.stdout(), "clean\n");
}
