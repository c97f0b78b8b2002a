use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use itertools::Itertools;

use crate::sniffer;

const DEFAULT_DIAL_TIMEOUT_SECS: i64 = 180;
const DEFAULT_IPTABLES_DIRECT_MARK: u32 = 0xff43;
const DEFAULT_IPTABLES_PROXY_CHAIN_NAME: &str = "redproxy-proxy";

/// A transparent TCP forwarder that tunnels REDIRECTed connections through
/// an upstream HTTP proxy using CONNECT.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// config file filepath
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// working directory
    #[arg(short, long, default_value = ".")]
    work_dir: String,
}

pub enum InterceptMode {
    REDIRECT {
        local_traffic: bool,
        ports: String,
        direct_mark: u32,
        proxy_chain: String,
    },
    MANUAL,
}

impl InterceptMode {
    /// SO_MARK value that outbound sockets must carry so their traffic is
    /// skipped by the nat rules, when this process manages them.
    pub fn direct_mark(&self) -> Option<u32> {
        match self {
            InterceptMode::REDIRECT { direct_mark, .. } => Some(*direct_mark),
            InterceptMode::MANUAL => None,
        }
    }
}

pub enum SniffMode {
    Disabled,
    /// Zero `timeout`/`max_data` mean "use the sniffer defaults".
    Parallel {
        timeout: Duration,
        max_data: usize,
        strategies: Vec<String>,
    },
}

pub struct Settings {
    pub debug: bool,
    pub disable_ipv6: bool,
    pub listen: Option<String>,
    pub upstream_proxy: String,
    pub dial_timeout: Duration,
    /// Fixed origin for every connection, bypassing SO_ORIGINAL_DST.
    /// Debugging aid; never set in production.
    pub default_origin: Option<String>,
    pub sniff: SniffMode,
    pub intercept_mode: InterceptMode,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load()
    }

    pub fn load() -> Result<Self, ConfigError> {
        let args = Args::parse();
        std::env::set_current_dir(&args.work_dir).map_err(|e| {
            ConfigError::Message(format!(
                "Failed to set working directory '{}': {}",
                args.work_dir, e
            ))
        })?;

        let s = Config::builder()
            .add_source(File::with_name(&args.config))
            .add_source(Environment::with_prefix("redproxy"))
            .build()?;

        let settings = Settings {
            debug: s.get_bool("debug").unwrap_or(false),
            disable_ipv6: s.get_bool("disable-ipv6").unwrap_or(false),
            listen: s.get::<String>("listen").ok(),
            upstream_proxy: s
                .get::<String>("upstream-proxy")
                .map_err(|_| ConfigError::Message("upstream-proxy must be configured.".to_owned()))?,
            dial_timeout: Duration::from_secs(
                s.get_int("dial-timeout")
                    .unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS)
                    .max(1) as u64,
            ),
            default_origin: s.get::<String>("default-origin").ok(),
            sniff: parse_sniff_mode(&s)?,
            intercept_mode: parse_intercept_mode(&s)?,
        };

        validate_settings(&settings)?;

        Ok(settings)
    }
}

fn parse_sniff_mode(s: &Config) -> Result<SniffMode, ConfigError> {
    // Mirrors the CLI convention of the original tool: a negative budget
    // disables sniffing entirely, zero selects the built-in default.
    let timeout_ms = s.get_int("sniff-timeout-ms").unwrap_or(0);
    if timeout_ms < 0 {
        return Ok(SniffMode::Disabled);
    }

    let max_data = s.get_int("sniff-max-bytes").unwrap_or(0).max(0) as usize;

    let strategies = match s.get_array("sniff-strategies") {
        Ok(values) => values
            .into_iter()
            .map(|v| {
                v.into_string().map_err(|e| {
                    ConfigError::Message(format!("strategy name must be a string: {}", e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Err(_) => vec!["http".to_owned(), "tls".to_owned()],
    };

    if strategies.is_empty() {
        return Err(ConfigError::Message(
            "sniff-strategies must name at least one strategy.".to_owned(),
        ));
    }
    for name in &strategies {
        if sniffer::strategy_by_name(name).is_none() {
            return Err(ConfigError::Message(format!(
                "'{}' is not a known sniffing strategy",
                name
            )));
        }
    }

    Ok(SniffMode::Parallel {
        timeout: Duration::from_millis(timeout_ms as u64),
        max_data,
        strategies,
    })
}

fn parse_intercept_mode(s: &Config) -> Result<InterceptMode, ConfigError> {
    let table = match s.get_table("traffic-intercept") {
        Err(_) => return Ok(InterceptMode::MANUAL),
        Ok(t) => t,
    };

    let mode = table
        .get("mode")
        .ok_or_else(|| ConfigError::Message("mode field not found.".to_string()))?
        .clone()
        .into_string()
        .map(|s| s.to_lowercase())
        .map_err(|e| ConfigError::Message(format!("Failed to parse mode: {}", e)))?;

    match mode.as_str() {
        "manual" => Ok(InterceptMode::MANUAL),
        "auto" | "redirect" => {
            let local_traffic = table
                .get("local-traffic")
                .and_then(|v| v.clone().into_bool().ok())
                .unwrap_or(false);

            let ports = match table.get("ports") {
                Some(v) => {
                    let arr = v.clone().into_array().map_err(|e| {
                        ConfigError::Message(format!("ports must be an array: {}", e))
                    })?;
                    multiport_dports(&arr)?
                }
                None => {
                    return Err(ConfigError::Message(
                        "redirect interception requires a ports list.".to_owned(),
                    ))
                }
            };

            let direct_mark = table
                .get("direct-mark")
                .and_then(|v| v.clone().into_int().ok())
                .unwrap_or(DEFAULT_IPTABLES_DIRECT_MARK as i64) as u32;
            let proxy_chain = table
                .get("proxy-chain")
                .and_then(|v| v.clone().into_string().ok())
                .unwrap_or_else(|| DEFAULT_IPTABLES_PROXY_CHAIN_NAME.to_string());

            Ok(InterceptMode::REDIRECT {
                local_traffic,
                ports,
                direct_mark,
                proxy_chain,
            })
        }
        _ => Err(ConfigError::Message(
            "either `auto/redirect` or `manual` is expected.".to_owned(),
        )),
    }
}

/// iptables multiport wants a compact `port[:port]` list; the config may
/// hand us single ports and `start-end` spans in any order, possibly
/// overlapping. Spans that touch are folded together before rendering.
fn multiport_dports(values: &[config::Value]) -> Result<String, ConfigError> {
    let mut spans = values
        .iter()
        .map(parse_port_span)
        .collect::<Result<Vec<_>, _>>()?;
    if spans.is_empty() {
        return Err(ConfigError::Message("ports must not be empty.".to_owned()));
    }

    spans.sort_unstable();
    Ok(spans
        .into_iter()
        .coalesce(|(lo, hi), (next_lo, next_hi)| {
            if next_lo <= hi.saturating_add(1) {
                Ok((lo, hi.max(next_hi)))
            } else {
                Err(((lo, hi), (next_lo, next_hi)))
            }
        })
        .map(|(lo, hi)| {
            if lo == hi {
                lo.to_string()
            } else {
                format!("{}:{}", lo, hi)
            }
        })
        .join(","))
}

fn parse_port_span(value: &config::Value) -> Result<(u16, u16), ConfigError> {
    let text = value
        .clone()
        .into_string()
        .map_err(|e| ConfigError::Message(format!("port entry must be a string: {}", e)))?;

    let (lo, hi) = match text.split_once('-') {
        Some((lo, hi)) => (lo, hi),
        None => (text.as_str(), text.as_str()),
    };
    let port = |s: &str| {
        s.trim().parse::<u16>().map_err(|e| {
            ConfigError::Message(format!("invalid port '{}' in entry '{}': {}", s, text, e))
        })
    };
    let span = (port(lo)?, port(hi)?);
    if span.0 > span.1 {
        return Err(ConfigError::Message(format!(
            "port range '{}' runs backwards",
            text
        )));
    }
    Ok(span)
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    // Without managed interception the listener address cannot be invented.
    if settings.listen.is_none() && matches!(settings.intercept_mode, InterceptMode::MANUAL) {
        return Err(ConfigError::Message(
            "a listen address is required unless traffic-intercept mode is redirect.".to_string(),
        ));
    }

    Ok(())
}
