use crate::config::{ConfigError, SealConfig};
use crate::tpm::{HandleMap, Invoke, PrimaryKey, SealMap, TpmError, Tpm2};
use std::io::{self, BufRead, Write};
use std::path::Path;
use thiserror::Error;

/// How far the sealing workflow has got. Ordered, a later state implies
/// every earlier one completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SealState {
    Uninitialized,
    ConfigLoaded,
    TpmProbed,
    PrimaryCreated,
    Persisted,
    MapRead,
}

#[derive(Error, Debug)]
pub enum GuardError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot {action} before reaching {needed:?}, currently {current:?}")]
    OutOfOrder {
        action: &'static str,
        needed: SealState,
        current: SealState,
    },
    #[error("no NV handles available to select from")]
    NoHandles,
    #[error("gave up after {0} attempts")]
    RetriesExhausted(usize),
    #[error("failed to read operator input")]
    Prompt(#[source] io::Error),
}

pub type Result<T, E = GuardError> = core::result::Result<T, E>;

/// Source of operator answers
pub trait Prompt {
    fn ask(&mut self, question: &str) -> io::Result<String>;
}

/// Prompts on stdout and blocks on a line from stdin.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{question}")?;
        stdout.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim().to_string())
    }
}

fn confirm(prompt: &mut impl Prompt, question: &str) -> Result<bool> {
    let answer = prompt.ask(question).map_err(GuardError::Prompt)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Upper bound on interactive attempts for handle selection and map reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Outcome of the interactive map read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOutcome {
    Read(SealMap),
    Aborted,
}

/// One step of the interactive map-read loop
enum Step {
    Select { attempt: usize },
    Read { attempt: usize, handle: String },
    Retry { attempt: usize, error: TpmError },
    Done(MapOutcome),
}

/// Drives primary key creation, persistence and seal map reads against the
/// TPM. A failed step leaves [`SealState`] where it was.
pub struct CattleGuard<I> {
    tpm: Tpm2<I>,
    state: SealState,
    config: Option<SealConfig>,
    handles: HandleMap,
    primary: Option<PrimaryKey>,
    map_data: Option<SealMap>,
    retry: RetryPolicy,
}

impl<I: Invoke> CattleGuard<I> {
    pub fn new(tpm: Tpm2<I>) -> Self {
        Self {
            tpm,
            state: SealState::Uninitialized,
            config: None,
            handles: HandleMap::default(),
            primary: None,
            map_data: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> SealState {
        self.state
    }

    pub fn config(&self) -> Option<&SealConfig> {
        self.config.as_ref()
    }

    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }

    pub fn primary(&self) -> Option<&PrimaryKey> {
        self.primary.as_ref()
    }

    pub fn map_data(&self) -> Option<&SealMap> {
        self.map_data.as_ref()
    }

    pub fn tpm(&mut self) -> &mut Tpm2<I> {
        &mut self.tpm
    }

    fn require(&self, action: &'static str, needed: SealState) -> Result<()> {
        if self.state < needed {
            return Err(GuardError::OutOfOrder {
                action,
                needed,
                current: self.state,
            });
        }
        Ok(())
    }

    fn loaded_config(&self) -> Result<&SealConfig> {
        self.config.as_ref().ok_or(GuardError::OutOfOrder {
            action: "use the config",
            needed: SealState::ConfigLoaded,
            current: self.state,
        })
    }

    pub fn load_config(&mut self, path: impl AsRef<Path>) -> Result<&SealConfig> {
        let config = SealConfig::load_or_create(path)?;
        self.use_config(config);
        self.loaded_config()
    }

    pub fn use_config(&mut self, config: SealConfig) {
        self.config = Some(config);
        self.state = self.state.max(SealState::ConfigLoaded);
    }

    /// Checks the TPM answers and discovers the defined NV indices.
    pub fn probe(&mut self) -> Result<&HandleMap> {
        self.require("probe the TPM", SealState::ConfigLoaded)?;
        let random = self.tpm.getrandom(32)?;
        log::debug!("Checking TPM by reading random data: {}", hex::encode(&random));
        let handles = self.tpm.get_handles()?;
        if !handles.is_empty() {
            log::info!("Found TPM handles: {}", handles);
        }
        self.handles = handles;
        self.state = self.state.max(SealState::TpmProbed);
        Ok(&self.handles)
    }

    pub fn create_primary(&mut self) -> Result<&PrimaryKey> {
        self.require("create the primary key", SealState::TpmProbed)?;
        let config = self.loaded_config()?;
        let (hierarchy, parent_auth) = (config.primary_hierarchy, config.parent_auth.clone());
        let primary = self.tpm.createprimary(hierarchy, parent_auth.as_deref())?;
        log::info!("Created primary key with rsa: {}", primary.rsa);
        self.state = self.state.max(SealState::PrimaryCreated);
        Ok(self.primary.insert(primary))
    }

    /// Moves the primary key into persistent storage, returning the tool's report.
    pub fn persist(&mut self) -> Result<String> {
        self.require("persist the primary key", SealState::PrimaryCreated)?;
        let config = self.loaded_config()?;
        let (hierarchy, parent_auth) = (config.primary_hierarchy, config.parent_auth.clone());
        let primary = self.primary.as_ref().ok_or(GuardError::OutOfOrder {
            action: "persist the primary key",
            needed: SealState::PrimaryCreated,
            current: self.state,
        })?;
        let report = self
            .tpm
            .evictcontrol(&primary.context, hierarchy, parent_auth.as_deref())?;
        self.state = self.state.max(SealState::Persisted);
        Ok(String::from_utf8_lossy(&report).into_owned())
    }

    /// Creates the primary key and offers to persist it.
    pub fn init_primary(&mut self, prompt: &mut impl Prompt) -> Result<Option<String>> {
        self.create_primary()?;
        if confirm(prompt, "Do you want to save the primary key context? [y/N]: ")? {
            return Ok(Some(self.persist()?));
        }
        Ok(None)
    }

    pub fn read_map(&mut self, handle: &str) -> Result<&SealMap> {
        self.require("read the seal map", SealState::PrimaryCreated)?;
        let map = self.tpm.read_seal_map(handle)?;
        log::info!("Got map data: {}", map);
        self.state = self.state.max(SealState::MapRead);
        Ok(self.map_data.insert(map))
    }

    /// Asks for an index into the discovered handles until a valid one is given.
    pub fn select_handle(&self, prompt: &mut impl Prompt) -> Result<String> {
        if self.handles.is_empty() {
            return Err(GuardError::NoHandles);
        }
        println!("Found nvram handles: {}", self.handles);
        for _ in 0..self.retry.max_attempts {
            let answer = prompt
                .ask("Enter the index of the handle to use: ")
                .map_err(GuardError::Prompt)?;
            match answer.trim().parse::<usize>() {
                Ok(index) => match self.handles.nth(index) {
                    Some(handle) => return Ok(handle.to_string()),
                    None => log::warn!("Invalid index, please enter a valid index"),
                },
                Err(_) => log::error!("Invalid input, please enter an integer"),
            }
        }
        Err(GuardError::RetriesExhausted(self.retry.max_attempts))
    }

    /// Interactive handle selection followed by a map read. Only execution
    /// failures of the read are offered a retry.
    pub fn read_map_interactive(&mut self, prompt: &mut impl Prompt) -> Result<MapOutcome> {
        let mut step = Step::Select { attempt: 1 };
        loop {
            step = match step {
                Step::Select { attempt } => Step::Read {
                    attempt,
                    handle: self.select_handle(prompt)?,
                },
                Step::Read { attempt, handle } => match self.read_map(&handle) {
                    Ok(map) => Step::Done(MapOutcome::Read(map.clone())),
                    Err(GuardError::Tpm(error)) if error.is_retryable() => {
                        Step::Retry { attempt, error }
                    }
                    Err(e) => return Err(e),
                },
                Step::Retry { attempt, error } => {
                    log::error!("Error reading map: {}", error);
                    if attempt >= self.retry.max_attempts {
                        return Err(GuardError::RetriesExhausted(attempt));
                    }
                    if confirm(prompt, "Try again? (y/n): ")? {
                        Step::Select {
                            attempt: attempt + 1,
                        }
                    } else {
                        Step::Done(MapOutcome::Aborted)
                    }
                }
                Step::Done(outcome) => return Ok(outcome),
            };
        }
    }
}
