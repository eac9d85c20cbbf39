use crate::config::DEFAULT_CONFIG_PATH;
use crate::guard::{CattleGuard, MapOutcome, StdinPrompt};
use crate::tpm::pcr::{parse_pcr_selection_list, PcrSelection};
use crate::tpm::{ProcessInvoker, Tpm2};
use clap::{Parser, Subcommand};
use either::Either;
use eyre::Result;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "CATTLEGUARD_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// the config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = CONFIG_ENV_VAR)]
    config: PathBuf,

    /// PCRs to seal against, overriding `seal_pcrs` from the config
    #[arg(short, long, value_name = "PCR List", value_parser = parse_pcr_selection_list)]
    pcrs: Option<PcrSelection>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Default)]
enum Commands {
    /// Create the primary key and optionally persist it
    #[default]
    InitPrimary,
    /// List the NV indices defined in the TPM
    Handles,
    /// Show the NV public areas defined in the TPM
    NvPublic,
    /// Select an NV index and read the seal map stored there
    ReadMap,
    /// Show the PCR selection used for sealing
    Pcrs,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        let mut guard = CattleGuard::new(Tpm2::<ProcessInvoker>::default());
        let config = guard.load_config(&self.config)?;
        let pcrs = match &self.pcrs {
            Some(pcrs) => pcrs.clone(),
            None => config.pcr_selection()?,
        };
        match self.command.as_ref().unwrap_or(&Commands::default()) {
            Commands::Pcrs => println!("{}", pcrs.to_tool_arg()),
            Commands::NvPublic => Self::show_nv_public(&mut guard)?,
            Commands::Handles => {
                for (index, (handle, size)) in guard.probe()?.iter().enumerate() {
                    println!("{index}: {handle} ({size} bytes)");
                }
            }
            Commands::InitPrimary => {
                log::info!("Sealing against PCRs {}", pcrs.to_tool_arg());
                guard.probe()?;
                if let Some(report) = guard.init_primary(&mut StdinPrompt)? {
                    println!("{report}");
                }
            }
            Commands::ReadMap => {
                guard.probe()?;
                guard.create_primary()?;
                if let MapOutcome::Read(map) = guard.read_map_interactive(&mut StdinPrompt)? {
                    println!("{}", serde_json::to_string(&map)?);
                }
            }
        };
        Ok(self)
    }

    fn show_nv_public(guard: &mut CattleGuard<ProcessInvoker>) -> Result<()> {
        let records = match guard.tpm().nv_public()? {
            Either::Left(record) => vec![record],
            Either::Right(records) => records,
        };
        for record in records {
            println!("{record}");
        }
        Ok(())
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}
