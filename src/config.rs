//! Configuração do pilot carregada a partir de `pilot.toml`.
//!
//! A struct [`PilotConfig`] contém todos os parâmetros configuráveis,
//! agrupados nas seções `[harvester]`, `[payload]` e `[hpc]`.
//! Valores não presentes no arquivo usam defaults do site Titan.
//! As variáveis de ambiente `PILOT_SCRATCH` e `PILOT_CONTAINER_IMAGE` têm
//! precedência sobre o arquivo.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;

/// Configuração de nível superior carregada de `pilot.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PilotConfig {
    /// Adaptador de recurso (site) usado nesta execução.
    #[serde(default)]
    pub resource: ResourceKind,

    #[serde(default)]
    pub harvester: HarvesterConfig,

    #[serde(default)]
    pub payload: PayloadConfig,

    #[serde(default)]
    pub hpc: HpcConfig,
}

/// Nomes dos arquivos trocados com o harvester.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarvesterConfig {
    /// Lista JSON de ids de job, indexada pelo rank.
    #[serde(default = "default_jobs_list_file")]
    pub jobs_list_file: String,

    /// Descrição do job, dentro de `<handoff>/<jobid>/`.
    #[serde(default = "default_job_description_file")]
    pub job_description_file: String,

    /// Relatório de trabalho publicado para o harvester.
    #[serde(default = "default_worker_attributes_file")]
    pub worker_attributes_file: String,

    /// Declaração de stage-out.
    #[serde(default = "default_stageout_file")]
    pub stageout_file: String,

    /// Armazenamento de checkpoints de tempo; vazio desativa a persistência.
    #[serde(default = "default_timing_file")]
    pub timing_file: String,
}

/// Arquivos e shell do payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PayloadConfig {
    #[serde(default = "default_jobreport")]
    pub jobreport: String,

    #[serde(default = "default_stdout")]
    pub stdout: String,

    #[serde(default = "default_stderr")]
    pub stderr: String,

    /// Shell usado para executar o comando do payload.
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Arquivo copiado uma única vez para a área de scratch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReferenceData {
    pub source: PathBuf,
    /// Caminho relativo à raiz do scratch.
    pub destination: PathBuf,
}

/// Link de compatibilidade criado no diretório de scratch do job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompatLink {
    pub target: PathBuf,
    /// Nome do link, relativo ao diretório de scratch do job.
    pub link: String,
}

/// Parâmetros específicos do site HPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HpcConfig {
    /// Raiz do armazenamento rápido (RAM disk); se não existir, o scratch é desativado.
    #[serde(default = "default_scratch")]
    pub scratch: PathBuf,

    /// Imagem de container; vazio executa o payload diretamente.
    #[serde(default)]
    pub container: String,

    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    /// Prefixo do sistema de arquivos compartilhado removido dos search paths.
    #[serde(default = "default_shared_fs_prefix")]
    pub shared_fs_prefix: String,

    /// Muda o diretório de trabalho do processo para o diretório do job.
    #[serde(default = "default_true")]
    pub change_directory: bool,

    /// Comandos de ambiente do site, executados antes do payload.
    #[serde(default = "default_setup")]
    pub setup: Vec<String>,

    /// Comandos de ambiente dentro do container.
    #[serde(default = "default_container_setup")]
    pub container_setup: Vec<String>,

    #[serde(default = "default_reference_data")]
    pub reference_data: Vec<ReferenceData>,

    #[serde(default = "default_links")]
    pub links: Vec<CompatLink>,

    /// Flags cujo arquivo é reescrito para apontar para o scratch.
    #[serde(default = "default_input_file_flags")]
    pub input_file_flags: Vec<String>,

    /// Tokens removidos do comando do payload.
    #[serde(default = "default_strip_tokens")]
    pub strip_tokens: Vec<String>,

    /// Padrões (`*` e `?`) de arquivos apagados do scratch antes do tar dos logs.
    #[serde(default = "default_redundant_files")]
    pub redundant_files: Vec<String>,
}

// Valores padrão dos nomes de arquivo do harvester.
fn default_jobs_list_file() -> String {
    "worker_pandaids.json".to_string()
}

fn default_job_description_file() -> String {
    "HPCJobs.json".to_string()
}

fn default_worker_attributes_file() -> String {
    "worker_attributes.json".to_string()
}

fn default_stageout_file() -> String {
    "event_status.dump.json".to_string()
}

fn default_timing_file() -> String {
    "pilot_timing.jsonl".to_string()
}

// Valores padrão do payload.
fn default_jobreport() -> String {
    "jobReport.json".to_string()
}

fn default_stdout() -> String {
    "payload.stdout".to_string()
}

fn default_stderr() -> String {
    "payload.stderr".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

// Valores padrão do site Titan.
fn default_scratch() -> PathBuf {
    PathBuf::from("/tmp/scratch/")
}

fn default_container_runtime() -> String {
    "singularity".to_string()
}

fn default_shared_fs_prefix() -> String {
    "/lustre/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_setup() -> Vec<String> {
    [
        "source /ccs/proj/csc108/athena_grid_env/setup.sh",
        "source $MODULESHOME/init/bash",
        "tmp_dirname=/tmp/scratch",
        "tmp_dirname+=\"/tmp\"",
        "export TEMP=$tmp_dirname",
        "export TMPDIR=$TEMP",
        "export TMP=$TEMP",
        "export LD_LIBRARY_PATH=/ccs/proj/csc108/AtlasReleases/ldpatch:$LD_LIBRARY_PATH",
        "export ATHENA_PROC_NUMBER=16",
        "export G4ATLAS_SKIPFILEPEEK=1",
        "export PANDA_RESOURCE=\"ORNL_Titan_MCORE\"",
        "export ROOT_TTREECACHE_SIZE=1",
        "export RUCIO_APPID=\"simul\"",
        "export RUCIO_ACCOUNT=\"pilot\"",
        "export CORAL_DBLOOKUP_PATH=/ccs/proj/csc108/AtlasReleases/21.0.15/nfs_db_files",
        "export CORAL_AUTH_PATH=$SW_INSTALL_AREA/DBRelease/current/XMLConfig",
        "export DATAPATH=$SW_INSTALL_AREA/DBRelease/current:$DATAPATH",
        "unset FRONTIER_SERVER",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_container_setup() -> Vec<String> {
    [
        "pwd",
        "export SW_INSTALL_AREA=/atlas_releases/AtlasOffline_21.0.15_x86_64-slc6-gcc49-opt",
        "source $SW_INSTALL_AREA/AtlasSetup/scripts/asetup.sh 21.0.15 --releasesarea=$SW_INSTALL_AREA --cmakearea=$SW_INSTALL_AREA/sw/lcg/contrib/CMake --gcclocation=$SW_INSTALL_AREA/sw/lcg/releases/gcc/4.9.3/x86_64-slc6",
        "export CORAL_DBLOOKUP_PATH=$SW_INSTALL_AREA/DBRelease/current/XMLConfig",
        "export CORAL_AUTH_PATH=$SW_INSTALL_AREA/DBRelease/current/XMLConfig",
        "export DATAPATH=$SW_INSTALL_AREA/DBRelease/current:$DATAPATH",
        "export ATHENA_PROC_NUMBER=16",
        "export G4ATLAS_SKIPFILEPEEK=1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_reference_data() -> Vec<ReferenceData> {
    let release = "/ccs/proj/csc108/AtlasReleases/21.0.15/DBRelease/current";
    vec![
        ReferenceData {
            source: PathBuf::from(format!("{release}/sqlite200/ALLP200.db")),
            destination: PathBuf::from("sqlite200/ALLP200.db"),
        },
        ReferenceData {
            source: PathBuf::from(format!("{release}/geomDB/geomDB_sqlite")),
            destination: PathBuf::from("geomDB/geomDB_sqlite"),
        },
    ]
}

fn default_links() -> Vec<CompatLink> {
    vec![CompatLink {
        target: PathBuf::from("/ccs/proj/csc108/AtlasReleases/21.0.15/nfs_db_files"),
        link: "poolcond".to_string(),
    }]
}

fn default_input_file_flags() -> Vec<String> {
    vec!["--inputEVNTFile".to_string()]
}

fn default_strip_tokens() -> Vec<String> {
    vec![
        "--DBRelease=\"all:current\"".to_string(),
        "--DBRelease=all:current".to_string(),
    ]
}

fn default_redundant_files() -> Vec<String> {
    ["core", "core.*", "*.pyc", "__pycache__"]
        .map(String::from)
        .to_vec()
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            jobs_list_file: default_jobs_list_file(),
            job_description_file: default_job_description_file(),
            worker_attributes_file: default_worker_attributes_file(),
            stageout_file: default_stageout_file(),
            timing_file: default_timing_file(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            jobreport: default_jobreport(),
            stdout: default_stdout(),
            stderr: default_stderr(),
            shell: default_shell(),
        }
    }
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            scratch: default_scratch(),
            container: String::new(),
            container_runtime: default_container_runtime(),
            shared_fs_prefix: default_shared_fs_prefix(),
            change_directory: true,
            setup: default_setup(),
            container_setup: default_container_setup(),
            reference_data: default_reference_data(),
            links: default_links(),
            input_file_flags: default_input_file_flags(),
            strip_tokens: default_strip_tokens(),
            redundant_files: default_redundant_files(),
        }
    }
}

impl PilotConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<PilotConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(scratch) = lookup("PILOT_SCRATCH").filter(|v| !v.is_empty()) {
            self.hpc.scratch = PathBuf::from(scratch);
        }
        if let Some(image) = lookup("PILOT_CONTAINER_IMAGE").filter(|v| !v.is_empty()) {
            self.hpc.container = image;
        }
    }

    /// Imagem de container configurada, se houver.
    pub fn container_image(&self) -> Option<&str> {
        let image = self.hpc.container.trim();
        (!image.is_empty()).then_some(image)
    }
}
