//! Sandboxed python execution
//!
//! ```text
//! PythonRequest
//!   │ 1. static import + attribute check ──violation──▶ SandboxViolation (nothing spawned)
//!   ▼
//! python3 -I -u -c RUNNER          cwd = fresh temp dir, env cleared
//!   │ pre_exec (Linux): rlimits → drop capabilities → seccomp (no sockets)
//!   │ stdin: {"code", "inputs", "safe", "blocked", "allow_imports", "withheld", ...}
//!   │ runtime: AST check, whitelisted builtins, guarded __import__,
//!   │          imported modules wrapped in read-only views
//!   ▼
//! stdout: one JSON report {status, stdout, stderr, result, type, duration_ms}
//! ```

use std::process::Stdio;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::SandboxConfig;
use crate::error::{ToolError, ToolErrorKind};

/// Importable without `allow_imports`
pub const SAFE_MODULES: &[&str] = &[
    "math",
    "statistics",
    "random",
    "re",
    "itertools",
    "functools",
    "collections",
    "decimal",
    "fractions",
    "datetime",
    "json",
    "textwrap",
];

/// Never importable: network access, process control, FFI, import machinery
pub const BLOCKED_MODULES: &[&str] = &[
    "socket",
    "_socket",
    "ssl",
    "_ssl",
    "http",
    "urllib",
    "urllib3",
    "requests",
    "httpx",
    "aiohttp",
    "ftplib",
    "smtplib",
    "poplib",
    "imaplib",
    "nntplib",
    "telnetlib",
    "xmlrpc",
    "socketserver",
    "asyncio",
    "select",
    "selectors",
    "webbrowser",
    "subprocess",
    "os",
    "posix",
    "nt",
    "sys",
    "ctypes",
    "cffi",
    "multiprocessing",
    "importlib",
    "builtins",
    "pty",
    "signal",
    "mmap",
];

/// Builtins left out of the sandbox namespace; naming one is a violation
pub const WITHHELD_BUILTINS: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "dir",
    "input",
    "breakpoint",
    "help",
    "memoryview",
    "exit",
    "quit",
];

/// Attribute prefixes that reach interpreter frames and code objects
pub const FRAME_ATTR_PREFIXES: &[&str] = &["f_", "gi_", "cr_", "ag_", "tb_", "co_"];

lazy_static! {
    static ref PRIVATE_ATTR: Regex =
        Regex::new(r"\.\s*(_|(?:f|gi|cr|ag|tb|co)_)\w*").expect("valid attribute pattern");
    static ref WITHHELD_CALL: Regex = Regex::new(&format!(
        r"(?:^|[^.\w])({})\s*\(",
        WITHHELD_BUILTINS.join("|")
    ))
    .expect("valid builtin pattern");
}

/// Cap applied to the captured stdout/stderr fields of the report
const STREAM_CHARS: usize = 20_000;

const RUNNER: &str = r#"
import ast, builtins, contextlib, io, json, sys, time, traceback, types

payload = json.loads(sys.stdin.read())
SAFE = frozenset(payload["safe"])
BLOCKED = frozenset(payload["blocked"])
ALLOW = bool(payload["allow_imports"])
WITHHELD = frozenset(payload["withheld"])
FRAME_PREFIXES = tuple(payload["frame_prefixes"])
violations = []
_real_import = builtins.__import__

class SandboxBlocked(ImportError):
    pass

def _admit(name):
    root = name.partition(".")[0]
    if root in BLOCKED or (not ALLOW and root not in SAFE):
        violations.append(root)
        raise SandboxBlocked("import of %r is blocked in the sandbox" % root)

class _ModuleView:
    __slots__ = ("_mod",)

    def __init__(self, mod):
        object.__setattr__(self, "_mod", mod)

    def __getattribute__(self, attr):
        mod = object.__getattribute__(self, "_mod")
        if attr == "__class__":
            return _ModuleView
        if attr == "__dict__":
            return {k: v for k, v in vars(mod).items()
                    if not k.startswith("_") and not isinstance(v, types.ModuleType)}
        if attr.startswith("_") and attr not in ("__all__", "__name__"):
            violations.append(attr)
            raise SandboxBlocked("access to %r is blocked in the sandbox" % attr)
        value = getattr(mod, attr)
        if isinstance(value, types.ModuleType):
            _admit(value.__name__)
            return _ModuleView(value)
        return value

    def __setattr__(self, attr, value):
        raise SandboxBlocked("modules are read-only in the sandbox")

    def __repr__(self):
        return "<module %r>" % object.__getattribute__(self, "_mod").__name__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level:
        violations.append("relative import")
        raise SandboxBlocked("relative imports are not available in the sandbox")
    _admit(name)
    return _ModuleView(_real_import(name, globals, locals, fromlist, level))

ALLOWED_BUILTINS = (
    "print", "len", "range", "min", "max", "sum", "abs", "round", "enumerate",
    "list", "dict", "set", "frozenset", "tuple", "sorted", "reversed", "zip",
    "map", "filter", "any", "all", "str", "int", "float", "bool", "complex",
    "bytes", "bytearray", "repr", "format", "divmod", "pow", "hash", "chr", "ord",
    "hex", "oct", "bin", "isinstance", "issubclass", "iter", "next", "slice",
    "type", "object", "callable", "id", "ascii", "property", "staticmethod",
    "classmethod", "super", "__build_class__",
    "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "ImportError", "IndexError", "KeyError", "LookupError", "NameError", "NotImplementedError",
    "OverflowError", "RuntimeError", "StopIteration", "TypeError", "ValueError",
    "ZeroDivisionError", "NotImplemented", "Ellipsis",
)
safe_builtins = {name: getattr(builtins, name) for name in ALLOWED_BUILTINS}
safe_builtins["__import__"] = _guarded_import

def _reject(what):
    violations.append(what)
    raise SandboxBlocked("%s is not permitted in the sandbox" % what)

def _bound_names(tree):
    bound = set()
    for node in ast.walk(tree):
        if isinstance(node, ast.Name) and not isinstance(node.ctx, ast.Load):
            bound.add(node.id)
        elif isinstance(node, ast.arg):
            bound.add(node.arg)
        elif isinstance(node, (ast.FunctionDef, ast.AsyncFunctionDef, ast.ClassDef)):
            bound.add(node.name)
        elif isinstance(node, ast.alias):
            bound.add((node.asname or node.name).partition(".")[0])
    return bound

def _check(tree):
    bound = _bound_names(tree)
    for node in ast.walk(tree):
        if isinstance(node, ast.Attribute):
            if node.attr.startswith("_") or node.attr.startswith(FRAME_PREFIXES):
                _reject("attribute access to %r" % node.attr)
        elif isinstance(node, ast.Name):
            if node.id.startswith("__") or (node.id in WITHHELD and node.id not in bound):
                _reject("use of %r" % node.id)
        elif isinstance(node, ast.ImportFrom) and any(a.name == "*" for a in node.names):
            _reject("star import")

def _compile(src):
    tree = ast.parse(src, "<sandbox>", "exec")
    _check(tree)
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        last = tree.body[-1]
        tree.body[-1] = ast.Assign(
            targets=[ast.Name(id="_result", ctx=ast.Store())], value=last.value)
        ast.fix_missing_locations(tree)
    return compile(tree, "<sandbox>", "exec")

inputs = payload.get("inputs") or {}
env = {"__name__": "__sandbox__", "__builtins__": safe_builtins, "inputs": inputs}
if isinstance(inputs, dict):
    for key, value in inputs.items():
        if isinstance(key, str) and key.isidentifier() and not key.startswith("__"):
            env[key] = value

out, err = io.StringIO(), io.StringIO()
status, error, result = "ok", None, None
start = time.perf_counter()
try:
    code = _compile(payload["code"])
    with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
        exec(code, env)
    result = env.get("_result", env.get("result"))
    if isinstance(result, _ModuleView):
        result = repr(result)
except SandboxBlocked as exc:
    status, error = "violation", str(exc)
except BaseException as exc:
    status = "error"
    error = "".join(traceback.format_exception_only(type(exc), exc)).strip()
if violations and status != "violation":
    status, error = "violation", "blocked operation attempted: " + ", ".join(violations)

report = {
    "status": status,
    "stdout": out.getvalue(),
    "stderr": err.getvalue(),
    "result": result,
    "type": None if result is None else type(result).__name__,
    "duration_ms": int((time.perf_counter() - start) * 1000),
}
if error:
    report["error"] = error
try:
    text = json.dumps(report, ensure_ascii=False, default=str)
except Exception:
    report["result"] = repr(result)
    text = json.dumps(report, ensure_ascii=False, default=str)
sys.stdout.write(text)
sys.stdout.flush()
"#;

/// A validated `python_exec` call
#[derive(Debug, Clone, PartialEq)]
pub struct PythonRequest {
    pub code: String,
    /// JSON object exposed as `inputs` (and as top-level names)
    pub inputs: Value,
    pub timeout: Option<Duration>,
    pub allow_imports: bool,
}

/// Reject code that imports blocked modules before anything is spawned
///
/// This is a line-level scan of `import` / `from` statements plus the
/// dynamic import entry points; the runner enforces the same lists at
/// runtime for anything the scan cannot see.
pub fn check_imports(code: &str, allow_imports: bool) -> Result<(), ToolError> {
    for token in ["__import__", "importlib", "__builtins__", "__loader__"] {
        if code.contains(token) {
            return Err(ToolError::sandbox(format!(
                "`{}` is not permitted in the sandbox",
                token
            )));
        }
    }

    for statement in code.lines().flat_map(|l| l.split(';')) {
        let statement = statement.trim();
        let modules: Vec<&str> = if let Some(rest) = statement.strip_prefix("import ") {
            rest.split(',')
                .filter_map(|part| part.split_whitespace().next())
                .collect()
        } else if let Some(rest) = statement.strip_prefix("from ") {
            match rest.split_whitespace().next() {
                Some(module) if module.starts_with('.') => {
                    return Err(ToolError::sandbox("relative imports are not available in the sandbox"));
                }
                Some(module) => vec![module],
                None => Vec::new(),
            }
        } else {
            continue;
        };

        for module in modules {
            let root = module.split('.').next().unwrap_or(module);
            if BLOCKED_MODULES.contains(&root) {
                return Err(ToolError::sandbox(format!(
                    "import of `{}` is not permitted in the sandbox (no network or process access)",
                    root
                )));
            }
            if !allow_imports && !SAFE_MODULES.contains(&root) {
                return Err(ToolError::sandbox(format!(
                    "import of `{}` requires allow_imports=true",
                    root
                )));
            }
        }
    }
    Ok(())
}

/// Reject private attribute access and withheld builtins before spawning
///
/// The runner repeats this on the parsed AST, so anything the text scan
/// misses is still reported as a violation.
pub fn check_access(code: &str) -> Result<(), ToolError> {
    if let Some(found) = PRIVATE_ATTR.find(code) {
        return Err(ToolError::sandbox(format!(
            "attribute access `{}` is not permitted in the sandbox",
            found.as_str().trim_start_matches('.').trim()
        )));
    }
    if let Some(name) = WITHHELD_CALL.captures(code).and_then(|c| c.get(1)) {
        return Err(ToolError::sandbox(format!(
            "`{}` is not available in the sandbox",
            name.as_str()
        )));
    }
    Ok(())
}

/// Runs python snippets in an isolated child process
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Requested timeout clamped to the configured maximum
    pub fn effective_timeout(&self, request: &PythonRequest) -> Duration {
        request
            .timeout
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    pub async fn run(&self, request: &PythonRequest) -> Result<Value, ToolError> {
        if request.code.chars().count() > self.config.max_code_chars {
            return Err(ToolError::invalid(format!(
                "code too long (limit {} characters)",
                self.config.max_code_chars
            )));
        }
        check_imports(&request.code, request.allow_imports)?;
        check_access(&request.code)?;

        let timeout = self.effective_timeout(request);
        let workdir = tempfile::Builder::new()
            .prefix("veil_py_")
            .tempdir()
            .map_err(|e| ToolError::failed(format!("failed to create sandbox directory: {}", e)))?;

        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg("-I")
            .arg("-u")
            .arg("-c")
            .arg(RUNNER)
            .current_dir(workdir.path())
            .env_clear()
            .env("HOME", workdir.path())
            .env("TMPDIR", workdir.path())
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        self.harden(&mut cmd, timeout)?;

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::failed(format!("python interpreter `{}` not found", self.config.python_bin))
            } else {
                ToolError::failed(format!("failed to start sandbox: {}", e))
            }
        })?;

        let payload = json!({
            "code": request.code,
            "inputs": request.inputs,
            "safe": SAFE_MODULES,
            "blocked": BLOCKED_MODULES,
            "allow_imports": request.allow_imports,
            "withheld": WITHHELD_BUILTINS,
            "frame_prefixes": FRAME_ATTR_PREFIXES,
        })
        .to_string();

        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit before reading; its report says why
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "sandbox stdin closed early");
            }
        }

        let started = Instant::now();
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::failed(format!("sandbox wait failed: {}", e))),
            Err(_) => {
                return Err(ToolError::new(
                    ToolErrorKind::Timeout,
                    format!("execution timed out after {}s", timeout.as_secs()),
                ))
            }
        };
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, status = ?output.status, "sandbox exited");

        parse_report(&output.stdout, &output.stderr, output.status)
    }

    #[cfg(target_os = "linux")]
    fn harden(&self, cmd: &mut Command, timeout: Duration) -> Result<(), ToolError> {
        use crate::security::{CapabilityDropper, NetworkSeccomp};

        let program = NetworkSeccomp::with_network_denied()
            .build()
            .map_err(|e| ToolError::failed(format!("failed to build seccomp filter: {}", e)))?;
        let dropper = CapabilityDropper::drop_all();
        let memory = self.config.memory_limit;
        let cpu_secs = timeout.as_secs() + 1;
        let file_bytes: u64 = 16 * 1024 * 1024;

        // SAFETY: the closure runs in the forked child before exec and only
        // issues setrlimit/capset/prctl/seccomp syscalls on prebuilt data.
        unsafe {
            cmd.pre_exec(move || {
                use nix::sys::resource::{setrlimit, Resource};

                setrlimit(Resource::RLIMIT_AS, memory, memory)?;
                setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
                setrlimit(Resource::RLIMIT_FSIZE, file_bytes, file_bytes)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                dropper.apply()?;
                NetworkSeccomp::apply_program(&program)?;
                Ok(())
            });
        }
        Ok(())
    }
}

fn parse_report(
    stdout: &[u8],
    stderr: &[u8],
    status: std::process::ExitStatus,
) -> Result<Value, ToolError> {
    let text = String::from_utf8_lossy(stdout);
    let mut report: Value = match serde_json::from_str(text.trim()) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return Err(ToolError::failed(format!(
                        "sandbox process killed by signal {} (resource limit exceeded?)",
                        signal
                    )));
                }
            }
            let detail: String = String::from_utf8_lossy(stderr).trim().chars().take(2_000).collect();
            return Err(ToolError::failed(format!(
                "malformed sandbox output (exit {}): {}",
                status, detail
            )));
        }
    };

    if report["status"] == "violation" {
        let message = report["error"].as_str().unwrap_or("blocked operation").to_string();
        return Err(ToolError::sandbox(message));
    }

    for key in ["stdout", "stderr"] {
        if let Some(s) = report[key].as_str() {
            if s.chars().count() > STREAM_CHARS {
                let clipped: String = s.chars().take(STREAM_CHARS).collect();
                report[key] = Value::String(clipped);
            }
        }
    }
    Ok(report)
}
