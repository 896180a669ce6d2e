use clap::Parser;
use std::sync::Arc;

/// CLI/env surface for the orchestrator daemon, mirroring `bvup`'s
/// `CmdArgs` shape: one derive-based `Parser`, defaults baked in, a couple of
/// env-var overrides layered on top after parsing.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Serverless micro-VM orchestrator", long_about = None)]
pub struct CmdArgs {
    /// containerd snapshotter used to resolve and pull images.
    #[arg(long = "snapshotter", default_value = "devmapper")]
    pub snapshotter: String,

    /// Network interface pool capacity.
    #[arg(long = "ni-num", default_value_t = 1500)]
    pub ni_num: usize,

    /// Number of taps provisioned per host bridge.
    #[arg(long = "taps-per-bridge", default_value_t = 256)]
    pub taps_per_bridge: u32,

    /// Control RPC listen port.
    #[arg(long = "port", default_value_t = 3333)]
    pub port: u16,

    /// Successful serves after which a function's instance is evicted.
    /// 0 disables eviction.
    #[arg(long = "served-threshold", default_value_t = 0)]
    pub served_threshold: u64,

    /// The lowest-numbered N function IDs (numeric ones only) are pinned
    /// and never evicted.
    #[arg(long = "pinned-func-num", default_value_t = 0)]
    pub pinned_func_num: u64,

    /// Use Offload (snapshot preserved) instead of full StopSingleVM on
    /// eviction. Overridable by the GOORCHSNAPSHOTS env var.
    #[arg(long = "save-memory", default_value_t = false)]
    pub save_memory: bool,
}

/// Immutable, `Arc`-shared configuration handed to the orchestrator and
/// function pool, the same shape `bv`'s `SharedConfig` takes.
#[derive(Debug, Clone)]
pub struct Config {
    pub snapshotter: String,
    pub ni_num: usize,
    pub taps_per_bridge: u32,
    pub port: u16,
    pub served_threshold: u64,
    pub pinned_func_num: u64,
    pub save_memory: bool,
}

pub type SharedConfig = Arc<Config>;

impl From<CmdArgs> for Config {
    fn from(args: CmdArgs) -> Self {
        let save_memory = match std::env::var("GOORCHSNAPSHOTS") {
            Ok(val) => val.eq_ignore_ascii_case("true"),
            Err(_) => args.save_memory,
        };
        Config {
            snapshotter: args.snapshotter,
            ni_num: args.ni_num,
            taps_per_bridge: args.taps_per_bridge,
            port: args.port,
            served_threshold: args.served_threshold,
            pinned_func_num: args.pinned_func_num,
            save_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_overrides_flag() {
        std::env::set_var("GOORCHSNAPSHOTS", "true");
        let args = CmdArgs::parse_from(["orchestratord"]);
        let config = Config::from(args);
        assert!(config.save_memory);
        std::env::remove_var("GOORCHSNAPSHOTS");
    }

    #[test]
    #[serial]
    fn defaults() {
        std::env::remove_var("GOORCHSNAPSHOTS");
        let args = CmdArgs::parse_from(["orchestratord"]);
        let config = Config::from(args);
        assert_eq!(config.snapshotter, "devmapper");
        assert_eq!(config.ni_num, 1500);
        assert_eq!(config.port, 3333);
        assert!(!config.save_memory);
    }
}
