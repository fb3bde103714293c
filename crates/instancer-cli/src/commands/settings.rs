//! `instancer settings` — Show or change runtime settings.

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::{Args, Subcommand};
use instancer_common::config::{
    KEY_CONNECTION_ENDPOINT, KEY_EXPIRATION_MINUTES, KEY_MAX_CPU_CORES, KEY_MAX_MEMORY_MB,
    KEY_PUBLIC_HOSTNAME,
};
use instancer_runtime::service::{Ack, Instancer};

use crate::output;

/// Settings subcommands.
#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Print the stored settings.
    Show,
    /// Validate and store new settings, then reconnect if needed.
    Set(SetArgs),
}

/// Arguments for `settings set`. Every key is submitted, as the admin
/// form does.
#[derive(Args, Debug)]
pub struct SetArgs {
    /// Runtime endpoint (`unix:///path`, `tcp://host:port`,
    /// `ssh://user@host`); empty disables the backend.
    #[arg(long, default_value = "")]
    pub endpoint: String,

    /// Hostname players connect to.
    #[arg(long)]
    pub hostname: String,

    /// Instance lifetime in minutes; 0 disables the reaper.
    #[arg(long)]
    pub expiration: String,

    /// Memory cap per container in MB; empty or 0 for none.
    #[arg(long, default_value = "")]
    pub max_memory: String,

    /// CPU cap per container in cores; empty or 0 for none.
    #[arg(long, default_value = "")]
    pub max_cpu: String,
}

impl SetArgs {
    fn into_form(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_CONNECTION_ENDPOINT.to_string(), self.endpoint),
            (KEY_PUBLIC_HOSTNAME.to_string(), self.hostname),
            (KEY_EXPIRATION_MINUTES.to_string(), self.expiration),
            (KEY_MAX_MEMORY_MB.to_string(), self.max_memory),
            (KEY_MAX_CPU_CORES.to_string(), self.max_cpu),
        ])
    }
}

/// Executes a `settings` subcommand.
///
/// # Errors
///
/// Returns an error if output cannot be written.
pub async fn execute(instancer: &Instancer, cmd: SettingsCommand) -> anyhow::Result<ExitCode> {
    match cmd {
        SettingsCommand::Show => output::emit(instancer.show_settings().map(|s| s.to_pairs())),
        SettingsCommand::Set(args) => {
            let result = instancer.update_settings(&args.into_form()).await;
            output::emit(result.map(|()| Ack {
                success: "settings saved".into(),
            }))
        }
    }
}
