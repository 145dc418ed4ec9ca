//! Subprocess plumbing: spawn, capture both pipes, wait.

use std::{
    io,
    process::{Command, Stdio},
};

use crate::env::Environment;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit status; 128 + signal number when killed by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs `argv` to completion with the given environment.
///
/// Both pipes are captured in full. Spawn failures (missing binary,
/// permissions) surface as an error naming the command.
pub fn run(argv: &[String], env: &Environment) -> io::Result<ExecResult> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = command
        .output()
        .map_err(|e| io::Error::new(e.kind(), format!("cannot run '{program}': {e}")))?;
    let status = output.status.code().unwrap_or(128);
    Ok(ExecResult {
        status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn captures_stdout_and_status() {
        let env = Environment::from_vars([("PATH".to_owned(), "/usr/bin:/bin".to_owned())]);
        let result = run(&["sh".to_owned(), "-c".to_owned(), "echo hi; exit 3".to_owned()], &env).unwrap();
        assert_eq!(result.stdout, b"hi\n");
        assert_eq!(result.status, 3);
    }

    #[test]
    fn environment_is_passed_through() {
        let env = {
            let mut env = Environment::from_vars([("PATH".to_owned(), "/usr/bin:/bin".to_owned())]);
            env.set("DON_TEST_VAR", Some("marker".to_owned()));
            env
        };
        let result = run(
            &["sh".to_owned(), "-c".to_owned(), "printf %s \"$DON_TEST_VAR\"".to_owned()],
            &env,
        )
        .unwrap();
        assert_eq!(result.stdout, b"marker");
    }

    #[test]
    fn missing_binary_is_an_error() {
        let env = Environment::from_vars([]);
        assert!(run(&["definitely-not-a-binary-xyz".to_owned()], &env).is_err());
    }
}
