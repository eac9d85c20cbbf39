use ambassador::{delegatable_trait, Delegate};
use either::Either;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;

pub mod nv;
pub mod pcr;
pub mod seal_map;
pub mod types;

pub use nv::{parse_nv_public, scan_handles, HandleMap, NvPublic};
pub use seal_map::SealMap;

/// Every tpm2-tools binary is named `tpm2_<verb>`
pub const TOOL_PREFIX: &str = "tpm2_";
/// Size of the context blob written by `tpm2_createprimary` for an RSA2048 primary
pub const PRIMARY_CONTEXT_LEN: usize = 2072;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDenied {
    #[error("Permission denied. Please run the command as root.")]
    DeviceAccess,
    #[error("Authorization failure. Please check the TPM2 authorization value.")]
    Authorization,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MalformedOutput {
    #[error("unexpected value line, mode is not set: `{0}`")]
    UnexpectedValue(String),
    #[error("field line `{0}` appears before the NV index address")]
    MissingAddress(String),
    #[error("invalid NV index address line `{0}`")]
    InvalidAddress(String),
    #[error("invalid hex for {field}: `{value}`")]
    InvalidHex { field: &'static str, value: String },
    #[error("invalid size `{0}`")]
    InvalidSize(String),
    #[error("{0} given twice for one NV index")]
    DuplicateField(&'static str),
    #[error("NV index {address:#x} has no {field}")]
    MissingField { address: u32, field: &'static str },
    #[error("NV index {address:#x} ends before a header got its value")]
    MissingValue { address: u32 },
    #[error("NV index {0:#x} is not terminated by a blank line")]
    UnterminatedEntry(u32),
    #[error("no NV public records found in output")]
    NoRecords,
    #[error("RSA key not found in createprimary output")]
    MissingRsa,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("size must be positive, got {0}")]
    NegativeSize(i64),
    #[error("Handle not found in map data: {0}")]
    MissingMapField(&'static str),
    #[error("primary context length is {actual} bytes, expected {expected}")]
    ContextLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum TpmError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    #[error("Failed to run command '{command}', error:\n{stderr}")]
    ExecutionFailed { command: String, stderr: String },
    #[error(transparent)]
    MalformedOutput(#[from] MalformedOutput),
    #[error(transparent)]
    ValidationFailed(#[from] ValidationError),
    #[error("failed to launch `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TpmError {
    /// Only plain execution failures are worth asking the operator to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TpmError::ExecutionFailed { .. })
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// What a finished tool invocation left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs one external command from an argument vector, never through a shell.
#[delegatable_trait]
pub trait Invoke {
    fn invoke(&mut self, argv: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput>;
}

/// Invoker backed by real processes, blocking until they exit
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInvoker;

impl Invoke for ProcessInvoker {
    fn invoke(&mut self, argv: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| TpmError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        })?;
        let spawn_err = |source| TpmError::Spawn {
            command: argv.join(" "),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        // stdin is fed from its own thread so a full stdout pipe can't stall us
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_vec();
                Some(std::thread::spawn(move || pipe.write_all(&input)))
            }
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let written = writer.join().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "stdin writer panicked")
            })?;
            match written {
                // the tool exited without reading everything, its status says why
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

static DEVICE_PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Failed to open specified TCTI device file /dev/tpmrm\d+: Permission denied")
        .unwrap()
});
static AUTH_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"authorization failure without DA implications").unwrap());

/// Turns a finished invocation into its stdout, or the error it reported.
pub fn classify(argv: &[String], output: CommandOutput) -> Result<Vec<u8>> {
    if output.success() {
        return Ok(output.stdout);
    }
    if DEVICE_PERMISSION.is_match(&output.stderr) {
        return Err(PermissionDenied::DeviceAccess.into());
    }
    if AUTH_FAILURE.is_match(&output.stderr) {
        return Err(PermissionDenied::Authorization.into());
    }
    Err(TpmError::ExecutionFailed {
        command: argv.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hierarchy {
    #[default]
    Owner,
    Platform,
    Endorsement,
    Null,
}

impl Hierarchy {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Hierarchy::Owner => "owner",
            Hierarchy::Platform => "platform",
            Hierarchy::Endorsement => "endorsement",
            Hierarchy::Null => "null",
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// A freshly created primary key, still only in volatile TPM memory
#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub context: Vec<u8>,
    pub rsa: String,
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryKey")
            .field("context", &format_args!("<{} bytes>", self.context.len()))
            .field("rsa", &self.rsa)
            .finish()
    }
}

fn rsa_from_output(output: &[u8]) -> Result<String> {
    let doc: serde_yaml::Value =
        serde_yaml::from_slice(output).map_err(|_| MalformedOutput::MissingRsa)?;
    let rsa = doc
        .get("rsa")
        .and_then(serde_yaml::Value::as_str)
        .ok_or(MalformedOutput::MissingRsa)?;
    hex::decode(rsa).map_err(|_| MalformedOutput::MissingRsa)?;
    Ok(rsa.to_string())
}

/// Typed front for the `tpm2_*` tool family
#[derive(Delegate)]
#[delegate(Invoke, target = "invoker", where = "I: Invoke")]
pub struct Tpm2<I> {
    invoker: I,
}

impl Default for Tpm2<ProcessInvoker> {
    fn default() -> Self {
        Self::new(ProcessInvoker)
    }
}

impl<I: Invoke> Tpm2<I> {
    pub fn new(invoker: I) -> Self {
        Self { invoker }
    }

    pub fn into_inner(self) -> I {
        self.invoker
    }

    /// Runs `tpm2_<verb> args...` and classifies the result.
    pub fn run<S: AsRef<str>>(
        &mut self,
        verb: &str,
        args: &[S],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(format!("{TOOL_PREFIX}{verb}"));
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        log::debug!("running {}", argv[0]);
        let output = self.invoke(&argv, stdin)?;
        classify(&argv, output)
    }

    pub fn nvreadpublic(&mut self) -> Result<Vec<u8>> {
        self.run::<&str>("nvreadpublic", &[], None)
    }

    pub fn nv_public(&mut self) -> Result<Either<NvPublic, Vec<NvPublic>>> {
        let output = self.nvreadpublic()?;
        parse_nv_public(&String::from_utf8_lossy(&output))
    }

    pub fn get_handles(&mut self) -> Result<HandleMap> {
        scan_handles(&self.nvreadpublic()?)
    }

    pub fn nvread(&mut self, handle: &str) -> Result<Vec<u8>> {
        self.run("nvread", &[handle], None)
    }

    pub fn read_seal_map(&mut self, handle: &str) -> Result<SealMap> {
        SealMap::decode(&self.nvread(handle)?)
    }

    pub fn getrandom(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        self.run("getrandom", &[num_bytes.to_string()], None)
    }

    pub fn createprimary(
        &mut self,
        hierarchy: Hierarchy,
        parent_auth: Option<&str>,
    ) -> Result<PrimaryKey> {
        let context_file = NamedTempFile::new()?;
        let context_path = context_file.path().to_string_lossy().into_owned();
        let mut args = vec![
            "--hierarchy".to_string(),
            hierarchy.as_arg().to_string(),
            "--key-context".to_string(),
            context_path,
        ];
        if let Some(auth) = parent_auth {
            args.extend(["--hierarchy-auth".to_string(), auth.to_string()]);
        }
        let output = self.run("createprimary", &args, None)?;
        let rsa = rsa_from_output(&output)?;

        let context = std::fs::read(context_file.path())?;
        if context.len() != PRIMARY_CONTEXT_LEN {
            return Err(ValidationError::ContextLength {
                expected: PRIMARY_CONTEXT_LEN,
                actual: context.len(),
            }
            .into());
        }
        Ok(PrimaryKey { context, rsa })
    }

    /// Persists a transient object given by its saved context.
    pub fn evictcontrol(
        &mut self,
        context: &[u8],
        hierarchy: Hierarchy,
        parent_auth: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut context_file = NamedTempFile::new()?;
        context_file.write_all(context)?;
        context_file.flush()?;
        let mut args = vec![
            "--hierarchy".to_string(),
            hierarchy.as_arg().to_string(),
            "--object-context".to_string(),
            context_file.path().to_string_lossy().into_owned(),
        ];
        if let Some(auth) = parent_auth {
            args.extend(["--auth".to_string(), auth.to_string()]);
        }
        self.run("evictcontrol", &args, None)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// One canned reply; `context` is written to the `--key-context` path.
    #[derive(Debug, Clone, Default)]
    pub struct Reply {
        pub output: CommandOutput,
        pub context: Option<Vec<u8>>,
    }

    impl Reply {
        pub fn ok(stdout: &[u8]) -> Self {
            Self {
                output: CommandOutput {
                    status: Some(0),
                    stdout: stdout.to_vec(),
                    stderr: Vec::new(),
                },
                context: None,
            }
        }

        pub fn fail(status: i32, stderr: &str) -> Self {
            Self {
                output: CommandOutput {
                    status: Some(status),
                    stdout: Vec::new(),
                    stderr: stderr.as_bytes().to_vec(),
                },
                context: None,
            }
        }

        pub fn with_context(mut self, context: Vec<u8>) -> Self {
            self.context = Some(context);
            self
        }
    }

    /// Replays canned replies in order and records what was asked.
    #[derive(Debug, Default)]
    pub struct ScriptedInvoker {
        pub replies: VecDeque<Reply>,
        pub calls: Vec<Vec<String>>,
        pub seen_files: Vec<(PathBuf, Vec<u8>)>,
    }

    impl ScriptedInvoker {
        pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a String> {
        argv.iter()
            .position(|a| a == flag)
            .and_then(|i| argv.get(i + 1))
    }

    impl Invoke for ScriptedInvoker {
        fn invoke(&mut self, argv: &[String], _stdin: Option<&[u8]>) -> Result<CommandOutput> {
            self.calls.push(argv.to_vec());
            let reply = self.replies.pop_front().unwrap_or_default();
            if let (Some(context), Some(path)) = (reply.context, flag_value(argv, "--key-context"))
            {
                std::fs::write(path, context)?;
            }
            if let Some(path) = flag_value(argv, "--object-context") {
                let path = PathBuf::from(path);
                let contents = std::fs::read(&path)?;
                self.seen_files.push((path, contents));
            }
            Ok(reply.output)
        }
    }
}
