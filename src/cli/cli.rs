use clap::Parser;

/// Inference Guardian - supervisory daemon for the speech backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// HTTP listen port
    #[arg(short, long, env = "GUARDIAN_PORT", default_value_t = 9777)]
    pub port: u16,

    /// HTTP listen address
    #[arg(short = 'a', long, env = "GUARDIAN_ADDRESS", default_value = "127.0.0.1")]
    pub address: String,

    /// Process poll cadence in seconds
    #[arg(long, env = "GUARDIAN_PROCESS_POLL_SECS", default_value_t = 3)]
    pub process_poll_secs: u64,

    /// Resource (GPU) poll cadence in seconds
    #[arg(long, env = "GUARDIAN_RESOURCE_POLL_SECS", default_value_t = 5)]
    pub resource_poll_secs: u64,

    /// GPU query tool binary
    #[arg(long, env = "GUARDIAN_GPU_TOOL", default_value = "nvidia-smi")]
    pub gpu_tool: String,
}
