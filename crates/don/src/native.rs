//! Native functions: builtins the VM dispatches through the work queue.
//!
//! Each native declares its name, parameter specs, and return count at
//! registry construction; the parser binds call sites against those
//! specs and the queue invokes the handler once the call's path
//! condition has resolved to true.

use sha2::{Digest, Sha512};
use smallvec::SmallVec;
use strum::{FromRepr, IntoStaticStr};

use crate::{
    cache::{Cache, DIGEST_SIZE},
    env::Environment,
    exec,
    heap::Heap,
    intern::{Interner, StringId},
    log::BuildOutput,
    value::{Truth, VRef},
};

/// Identifies a native function; doubles as the `InvokeNative`
/// instruction argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum NativeFn {
    Echo,
    Exec,
    Size,
    Lines,
    Getenv,
    Setenv,
    Fail,
}

/// Default for an unbound native parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultArg {
    /// The call site must supply a value.
    Required,
    Null,
    True,
    False,
    EmptyList,
}

/// Declared shape of one native function.
#[derive(Debug)]
pub struct NativeInfo {
    pub name: &'static str,
    pub params: &'static [(&'static str, DefaultArg)],
    pub returns: usize,
}

const NATIVE_TABLE: &[(NativeFn, NativeInfo)] = &[
    (
        NativeFn::Echo,
        NativeInfo {
            name: "echo",
            params: &[("message", DefaultArg::Required)],
            returns: 0,
        },
    ),
    (
        NativeFn::Exec,
        NativeInfo {
            name: "exec",
            params: &[
                ("command", DefaultArg::Required),
                ("env", DefaultArg::EmptyList),
                ("echo", DefaultArg::True),
                ("fail", DefaultArg::True),
                ("cache", DefaultArg::True),
            ],
            returns: 1,
        },
    ),
    (
        NativeFn::Size,
        NativeInfo {
            name: "size",
            params: &[("collection", DefaultArg::Required)],
            returns: 1,
        },
    ),
    (
        NativeFn::Lines,
        NativeInfo {
            name: "lines",
            params: &[("text", DefaultArg::Required)],
            returns: 1,
        },
    ),
    (
        NativeFn::Getenv,
        NativeInfo {
            name: "getenv",
            params: &[("name", DefaultArg::Required)],
            returns: 1,
        },
    ),
    (
        NativeFn::Setenv,
        NativeInfo {
            name: "setenv",
            params: &[("name", DefaultArg::Required), ("value", DefaultArg::Null)],
            returns: 0,
        },
    ),
    (
        NativeFn::Fail,
        NativeInfo {
            name: "fail",
            params: &[("message", DefaultArg::Null)],
            returns: 0,
        },
    ),
];

/// Registry mapping interned names to native ids and their specs.
#[derive(Debug)]
pub struct NativeRegistry {
    by_name: Vec<(StringId, NativeFn)>,
}

impl NativeRegistry {
    /// Builds the registry, interning every native name.
    pub fn new(interns: &mut Interner) -> Self {
        let by_name = NATIVE_TABLE
            .iter()
            .map(|(f, info)| (interns.add(info.name), *f))
            .collect();
        Self { by_name }
    }

    #[must_use]
    pub fn find(&self, name: StringId) -> Option<NativeFn> {
        self.by_name.iter().find(|(id, _)| *id == name).map(|&(_, f)| f)
    }

    #[must_use]
    pub fn info(f: NativeFn) -> &'static NativeInfo {
        &NATIVE_TABLE[f as usize].1
    }
}

/// Everything a native handler may touch.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub interns: &'a Interner,
    pub env: &'a mut Environment,
    pub cache: Option<&'a mut Cache>,
    pub out: &'a mut dyn BuildOutput,
}

/// A native call that must halt the calling VM.
#[derive(Debug)]
pub struct NativeFailure(pub String);

type NativeResult = Result<SmallVec<[VRef; 2]>, NativeFailure>;

/// Runs a native function over concrete argument values.
///
/// Returns one value per declared return slot; a slot left equal to its
/// placeholder future stays unfulfilled.
pub fn invoke(f: NativeFn, ctx: &mut NativeCtx<'_>, args: &[VRef]) -> NativeResult {
    debug_assert_eq!(args.len(), NativeRegistry::info(f).params.len());
    match f {
        NativeFn::Echo => {
            let mut text = Vec::new();
            ctx.heap.write_string(ctx.interns, args[0], &mut text);
            ctx.out.out(&text);
            Ok(SmallVec::new())
        }
        NativeFn::Exec => native_exec(ctx, args),
        NativeFn::Size => {
            if !ctx.heap.is_collection(args[0]) {
                return Err(NativeFailure("size() requires a list".to_owned()));
            }
            let size = i32::try_from(ctx.heap.collection_size(args[0]))
                .map_err(|_| NativeFailure("list too large".to_owned()))?;
            Ok(SmallVec::from_slice(&[VRef::from_int(size)]))
        }
        NativeFn::Lines => {
            if !ctx.heap.is_string(args[0]) {
                return Err(NativeFailure("lines() requires a string".to_owned()));
            }
            let split = ctx.heap.split(ctx.interns, args[0], b"\n", false, true);
            Ok(SmallVec::from_slice(&[split]))
        }
        NativeFn::Getenv => {
            let name = ctx.heap.render(ctx.interns, args[0]);
            let value = match ctx.env.get(&name) {
                Some(value) => {
                    let bytes = value.as_bytes().to_vec();
                    ctx.heap.create_string(&bytes)
                }
                None => VRef::NULL,
            };
            Ok(SmallVec::from_slice(&[value]))
        }
        NativeFn::Setenv => {
            let name = ctx.heap.render(ctx.interns, args[0]);
            let value = if args[1].is_null() {
                None
            } else {
                Some(ctx.heap.render(ctx.interns, args[1]))
            };
            ctx.env.set(&name, value);
            Ok(SmallVec::new())
        }
        NativeFn::Fail => {
            let message = if args[0].is_null() {
                "Build failed".to_owned()
            } else {
                ctx.heap.render(ctx.interns, args[0])
            };
            Err(NativeFailure(message))
        }
    }
}

/// `exec(command, env, echo, fail, cache)`.
///
/// The cache digest covers the argv list and the environment override
/// list; a hit with unchanged dependencies replays the recorded output
/// and reports status 0 without spawning.
fn native_exec(ctx: &mut NativeCtx<'_>, args: &[VRef]) -> NativeResult {
    let (command, env_overrides, echo, fail, cache) = (args[0], args[1], args[2], args[3], args[4]);
    if !ctx.heap.is_collection(command) {
        return Err(NativeFailure("exec() requires a command list".to_owned()));
    }
    let argv: Vec<String> = ctx
        .heap
        .iterate(command)
        .map(|part| ctx.heap.render(ctx.interns, part))
        .collect();
    if argv.is_empty() {
        return Err(NativeFailure("exec() requires a non-empty command".to_owned()));
    }
    let echo = ctx.heap.truth(ctx.interns, echo) == Truth::True;
    let fail = ctx.heap.truth(ctx.interns, fail) == Truth::True;
    let use_cache = ctx.heap.truth(ctx.interns, cache) == Truth::True && ctx.cache.is_some();

    let mut cached_path = None;
    if use_cache {
        let digest = exec_digest(ctx.heap, ctx.interns, command, env_overrides);
        let cache = ctx.cache.as_deref_mut().expect("checked above");
        match cache.get(ctx.heap, &digest) {
            Ok(lookup) => {
                if lookup.uptodate {
                    if echo {
                        echo_cached(ctx.heap, ctx.interns, ctx.out, lookup.out, lookup.err);
                    }
                    return Ok(SmallVec::from_slice(&[VRef::from_int(0)]));
                }
                cached_path = Some(lookup.path);
            }
            Err(e) => return Err(NativeFailure(format!("cache error: {e}"))),
        }
    }

    // Overrides come as a flat [name, value, name, value, ...] list and
    // apply on top of the captured environment for this command only.
    let mut env_iter = ctx.heap.iterate(env_overrides).collect::<Vec<_>>().into_iter();
    let mut env = ctx.env.clone();
    while let Some(name) = env_iter.next() {
        let value = env_iter.next().unwrap_or(VRef::NULL);
        let name = ctx.heap.render(ctx.interns, name);
        if value.is_null() {
            env.set(&name, None);
        } else {
            let value = ctx.heap.render(ctx.interns, value);
            env.set(&name, Some(value));
        }
    }

    let result = exec::run(&argv, &env).map_err(|e| NativeFailure(e.to_string()))?;
    if echo {
        if !result.stdout.is_empty() {
            ctx.out.out(&result.stdout);
        }
        if !result.stderr.is_empty() {
            ctx.out.err(&result.stderr);
        }
    }
    if result.status != 0 {
        if fail {
            return Err(NativeFailure(format!(
                "Command '{}' failed with status {}",
                argv[0], result.status
            )));
        }
        return Ok(SmallVec::from_slice(&[VRef::from_int(result.status)]));
    }

    if let Some(path) = cached_path {
        let deps = ctx.heap.singles().empty_list;
        let out = ctx.heap.create_string(&result.stdout);
        let err = ctx.heap.create_string(&result.stderr);
        let data = ctx.heap.singles().empty_string;
        let cache = ctx.cache.as_deref_mut().expect("cache path implies cache");
        cache
            .set_uptodate(ctx.heap, ctx.interns, &path, deps, out, err, data)
            .map_err(|e| NativeFailure(format!("cache error: {e}")))?;
    }
    Ok(SmallVec::from_slice(&[VRef::from_int(result.status)]))
}

/// Replays a cache hit's recorded output through the sink.
fn echo_cached(heap: &Heap, interns: &Interner, out: &mut dyn BuildOutput, stdout: VRef, stderr: VRef) {
    let mut bytes = Vec::new();
    heap.write_string(interns, stdout, &mut bytes);
    if !bytes.is_empty() {
        out.out(&bytes);
    }
    bytes.clear();
    heap.write_string(interns, stderr, &mut bytes);
    if !bytes.is_empty() {
        out.err(&bytes);
    }
}

/// Digest of a cacheable command: argv plus environment overrides.
fn exec_digest(heap: &Heap, interns: &Interner, command: VRef, env_overrides: VRef) -> [u8; DIGEST_SIZE] {
    let mut state = Sha512::new();
    heap.hash_into(interns, &mut state, command);
    heap.hash_into(interns, &mut state, env_overrides);
    let full = state.finalize();
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&full[..DIGEST_SIZE]);
    digest
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::log::CollectOutput;

    fn ctx_parts() -> (Heap, Interner, Environment, CollectOutput) {
        let mut interns = Interner::new();
        let _ = NativeRegistry::new(&mut interns);
        (Heap::new(), interns, Environment::from_vars([]), CollectOutput::new())
    }

    #[test]
    fn registry_resolves_names() {
        let mut interns = Interner::new();
        let registry = NativeRegistry::new(&mut interns);
        let echo = interns.add("echo");
        assert_eq!(registry.find(echo), Some(NativeFn::Echo));
        let unknown = interns.add("unknown");
        assert_eq!(registry.find(unknown), None);
        assert_eq!(NativeRegistry::info(NativeFn::Exec).params.len(), 5);
        assert_eq!(NativeRegistry::info(NativeFn::Exec).returns, 1);
    }

    #[test]
    fn echo_renders_values() {
        let (mut heap, interns, mut env, mut out) = ctx_parts();
        let list = heap.create_array(&[VRef::from_int(1), VRef::from_int(2)]);
        let mut ctx = NativeCtx {
            heap: &mut heap,
            interns: &interns,
            env: &mut env,
            cache: None,
            out: &mut out,
        };
        invoke(NativeFn::Echo, &mut ctx, &[list]).unwrap();
        assert_eq!(out.stdout(), "[1, 2]\n");
    }

    #[test]
    fn size_and_lines() {
        let (mut heap, interns, mut env, mut out) = ctx_parts();
        let text = heap.create_string(b"a\nb\n");
        let list = heap.create_array(&[VRef::from_int(5)]);
        let mut ctx = NativeCtx {
            heap: &mut heap,
            interns: &interns,
            env: &mut env,
            cache: None,
            out: &mut out,
        };
        let size = invoke(NativeFn::Size, &mut ctx, &[list]).unwrap();
        assert_eq!(size[0], VRef::from_int(1));
        let lines = invoke(NativeFn::Lines, &mut ctx, &[text]).unwrap();
        assert_eq!(ctx.heap.collection_size(lines[0]), 2);
    }

    #[test]
    fn env_natives_round_trip() {
        let (mut heap, interns, mut env, mut out) = ctx_parts();
        let name = heap.create_string(b"DON_FLAG");
        let value = heap.create_string(b"on");
        let mut ctx = NativeCtx {
            heap: &mut heap,
            interns: &interns,
            env: &mut env,
            cache: None,
            out: &mut out,
        };
        invoke(NativeFn::Setenv, &mut ctx, &[name, value]).unwrap();
        let got = invoke(NativeFn::Getenv, &mut ctx, &[name]).unwrap();
        assert_eq!(ctx.heap.render(ctx.interns, got[0]), "on");
        invoke(NativeFn::Setenv, &mut ctx, &[name, VRef::NULL]).unwrap();
        let gone = invoke(NativeFn::Getenv, &mut ctx, &[name]).unwrap();
        assert!(gone[0].is_null());
    }

    #[test]
    fn fail_halts_with_message() {
        let (mut heap, interns, mut env, mut out) = ctx_parts();
        let message = heap.create_string(b"no compiler");
        let mut ctx = NativeCtx {
            heap: &mut heap,
            interns: &interns,
            env: &mut env,
            cache: None,
            out: &mut out,
        };
        let err = invoke(NativeFn::Fail, &mut ctx, &[message]).unwrap_err();
        assert_eq!(err.0, "no compiler");
    }
}
