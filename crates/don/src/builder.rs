//! The top-level build driver.
//!
//! One invocation: read the script, parse and link it, run the init
//! function to populate the global fields, then run each requested
//! target on a fresh VM over the shared heap, environment, cache, and
//! work queue.

use std::{fmt, fs, io, path::PathBuf};

use crate::{
    bytecode::{Diagnostic, LinkedProgram, ParsedProgram, disassemble_function},
    cache::Cache,
    env::Environment,
    heap::Heap,
    intern::Interner,
    link::link,
    log::BuildOutput,
    namespace::{FunctionId, Namespace},
    native::{NativeCtx, NativeRegistry},
    parse::parse_script,
    value::VRef,
    vm::{Vm, VmEvent},
    work::{WorkItem, WorkQueue},
};

/// Knobs for one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub script: PathBuf,
    /// Cache directory; `None` disables result caching.
    pub cache_dir: Option<PathBuf>,
    /// Disassemble every function before executing (debug builds).
    pub disassemble: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            script: PathBuf::from("build.don"),
            cache_dir: Some(PathBuf::from(".don-cache")),
            disassemble: false,
        }
    }
}

/// Why a build did not succeed.
#[derive(Debug)]
pub enum BuildError {
    /// The script could not be read.
    Io { path: String, error: io::Error },
    /// Parse or link diagnostics; the build never started.
    Compile(Vec<Diagnostic>),
    /// Requested names that are not targets.
    UnknownTargets(Vec<String>),
    /// A cache or index file operation failed.
    Cache(io::Error),
    /// One or more VMs halted; messages carry file:line positions.
    Failed(Vec<String>),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error } => write!(f, "{path}: {error}"),
            Self::Compile(diagnostics) => {
                for (i, d) in diagnostics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{d}")?;
                }
                Ok(())
            }
            Self::UnknownTargets(names) => {
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "'{name}' is not a target.")?;
                }
                Ok(())
            }
            Self::Cache(error) => write!(f, "cache: {error}"),
            Self::Failed(messages) => {
                for (i, message) in messages.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{message}")?;
                }
                Ok(())
            }
        }
    }
}

/// Runs a build to completion. Targets default to `["default"]`.
pub fn run_build(options: &BuildOptions, targets: &[String], out: &mut dyn BuildOutput) -> Result<(), BuildError> {
    let script_path = options.script.display().to_string();
    let source = fs::read(&options.script).map_err(|error| BuildError::Io {
        path: script_path.clone(),
        error,
    })?;

    let mut interns = Interner::new();
    let natives = NativeRegistry::new(&mut interns);
    let mut heap = Heap::new();
    let mut ns = Namespace::new();
    let mut parsed = ParsedProgram::default();
    parse_script(&source, &script_path, &mut interns, &mut heap, &mut ns, &natives, &mut parsed);
    let program = link(parsed, &interns, &ns, &script_path).map_err(BuildError::Compile)?;

    let default_target = ["default".to_owned()];
    let target_names: &[String] = if targets.is_empty() { &default_target } else { targets };
    let mut resolved = Vec::with_capacity(target_names.len());
    let mut unknown = Vec::new();
    for name in target_names {
        match interns.find(name).and_then(|id| ns.get_target(id)) {
            Some(function) => resolved.push(function),
            None => unknown.push(name.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(BuildError::UnknownTargets(unknown));
    }

    if options.disassemble {
        for (id, _) in std::iter::once((FunctionId::INIT, ())).chain(ns.functions().map(|(id, _)| (id, ()))) {
            if id == FunctionId::INIT {
                println!("Init:");
            } else {
                println!("Function {}:", interns.get(ns.function(id).name));
            }
            print!("{}", disassemble_function(&program, &heap, &interns, id.index()));
        }
    }

    let mut cache = match &options.cache_dir {
        Some(dir) => Some(Cache::open(dir).map_err(BuildError::Cache)?),
        None => None,
    };
    let mut env = Environment::capture();
    let mut queue = WorkQueue::new();

    // The init function computes the global field values every target
    // starts from.
    let mut fields = program.fields.clone();
    fields = run_function(
        &program,
        &mut heap,
        &interns,
        &mut env,
        &mut cache,
        &mut queue,
        out,
        program.functions[FunctionId::INIT.index()],
        &[],
        fields,
    )?;

    for function in resolved {
        let entry = program.functions[function.index()];
        let args = default_arguments(&program, &ns, function);
        fields = run_function(
            &program,
            &mut heap,
            &interns,
            &mut env,
            &mut cache,
            &mut queue,
            out,
            entry,
            &args,
            fields,
        )?;
    }

    if let Some(cache) = cache {
        cache.close().map_err(BuildError::Cache)?;
    }
    Ok(())
}

/// Arguments for a target invoked from the command line: declared
/// defaults where present, null otherwise.
fn default_arguments(program: &LinkedProgram, ns: &Namespace, function: FunctionId) -> Vec<VRef> {
    ns.function(function)
        .params
        .iter()
        .map(|param| match param.default {
            Some(slot) => program.constants[(-slot - 1) as usize],
            None => VRef::NULL,
        })
        .collect()
}

/// Runs one function to completion across all the VMs it spawns.
/// Returns the surviving root VM's field table.
#[expect(clippy::too_many_arguments, reason = "the driver threads every runtime part")]
fn run_function(
    program: &LinkedProgram,
    heap: &mut Heap,
    interns: &Interner,
    env: &mut Environment,
    cache: &mut Option<Cache>,
    queue: &mut WorkQueue,
    out: &mut dyn BuildOutput,
    entry: usize,
    args: &[VRef],
    fields: Vec<VRef>,
) -> Result<Vec<VRef>, BuildError> {
    let mut vms: Vec<Vm> = vec![Vm::new(program, heap, entry, args, fields)];
    let mut failures: Vec<String> = Vec::new();
    let mut current = 0;
    while current < vms.len() {
        if !vms[current].is_active() {
            current += 1;
            continue;
        }
        match vms[current].run(program, heap, interns) {
            VmEvent::Done => current += 1,
            VmEvent::Halted => {
                queue.discard(current);
                if let Some(message) = vms[current].fail_message(program) {
                    failures.push(message);
                }
                current += 1;
            }
            VmEvent::Clone(vm) => vms.push(*vm),
            VmEvent::Work(payload) => {
                queue.add(WorkItem { vm: current, payload });
                let mut ctx = NativeCtx {
                    heap: &mut *heap,
                    interns,
                    env: &mut *env,
                    cache: cache.as_mut(),
                    out: &mut *out,
                };
                let outcomes = queue.drain(&mut ctx);
                for outcome in outcomes {
                    if let Some(failure) = outcome.failure {
                        vms[outcome.vm].halt(Some(outcome.position), failure.0);
                        if let Some(message) = vms[outcome.vm].fail_message(program) {
                            failures.push(message);
                        }
                    }
                }
                if !vms[current].is_active() {
                    current += 1;
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(vms.swap_remove(0).into_fields())
    } else {
        Err(BuildError::Failed(failures))
    }
}
