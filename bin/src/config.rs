//! consul-watch process configs

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "consul-watch-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/consul-watch/config.yaml";
    /// default log level. Can use this argument or WATCH_LOG env var
    pub const DEFAULT_WATCH_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::path::PathBuf;

    use anyhow::{Context, Result};
    pub use clap::Parser;
    use ::config::{CoordinationConfig, wire};
    use tracing::debug;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "consul-watch", bin_name = "consul-watch", about, long_about = None)]
    /// parses from cli & environment var. consul-watch will load `.env` in the working dir as well
    pub struct Config {
        /// path to the coordination config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// Consul agent address, overrides the config file
        #[clap(long, env, value_parser)]
        pub consul_addr: Option<String>,
        /// Consul ACL token, overrides the config file
        #[clap(long, env, value_parser, hide_env_values = true)]
        pub consul_token: Option<String>,
        /// service (connector group) to watch, overrides the config file
        #[clap(long, env, value_parser)]
        pub service_name: Option<String>,
        /// ID of this instance, overrides the config file
        #[clap(long, env, value_parser)]
        pub service_id: Option<String>,
        /// number of tokio worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_WATCH_LOG)]
        pub watch_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// Read the config file and apply command line overrides. Without a
        /// config file, `--service-name` alone is enough.
        pub fn load(&self) -> Result<CoordinationConfig> {
            let mut cfg = if self.config_path.exists() {
                CoordinationConfig::parse(&self.config_path)?
            } else {
                let name = self.service_name.as_deref().with_context(|| {
                    format!(
                        "no config at {} and no --service-name given",
                        self.config_path.display()
                    )
                })?;
                debug!(path = %self.config_path.display(), "config file not found, using defaults");
                CoordinationConfig::try_from(wire::Config {
                    consul: wire::Consul::default(),
                    service: wire::Service {
                        name: name.to_owned(),
                        id: None,
                        key_prefix: wire::default_key_prefix(),
                    },
                    watch: wire::Watch::default(),
                })?
            };

            if let Some(addr) = &self.consul_addr {
                cfg.consul.address = addr.clone();
            }
            if let Some(token) = self.consul_token.as_ref().filter(|t| !t.is_empty()) {
                cfg.consul.token = Some(token.clone());
            }
            if let Some(name) = &self.service_name {
                cfg.service_name = name.clone();
            }
            if let Some(id) = self.service_id.as_ref().filter(|id| !id.is_empty()) {
                cfg.service_id = Some(id.clone());
            }
            cfg.validate()?;
            Ok(cfg)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(watch_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(watch_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("reqwest=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
