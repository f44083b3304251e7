//! Interface de linha de comando do piloto baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, config)
//! e flags globais (--config, --resource, --verbose, --progress).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::resource::ResourceKind;

/// Piloto de job único para nós de computação HPC.
#[derive(Debug, Parser)]
#[command(name = "hpc-pilot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrões embutidos se ausente).
    #[arg(long, short, global = true, default_value = "pilot.toml")]
    pub config: PathBuf,

    /// Adaptador de recurso; sobrescreve o valor do arquivo de configuração.
    #[arg(long, global = true)]
    pub resource: Option<ResourceKind>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Mostra um spinner com a fase corrente no terminal.
    #[arg(long, global = true, default_value_t = false)]
    pub progress: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o job atribuído a este rank.
    Run {
        /// Diretório de troca de arquivos com o harvester.
        #[arg(long, default_value = ".")]
        harvester_workdir: PathBuf,

        /// Rank deste piloto; se omitido, vem do ambiente MPI/batch.
        #[arg(long)]
        rank: Option<usize>,
    },

    /// Imprime a configuração efetiva em TOML.
    Config,
}
