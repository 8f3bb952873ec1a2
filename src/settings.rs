use std::{net::SocketAddr, path::PathBuf, sync::OnceLock, time::SystemTime};

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Command line settings of the `warren` broker binary.
#[derive(Debug)]
pub struct Settings {
    addr: SocketAddr,
    tls_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    config: Option<PathBuf>,
    started: SystemTime,
}

impl Settings {
    const HELP_STRING: &'static str = r#"
usage: warren [arguments]

arguments:
    -a --addr      <socket address> address of the plain listener
                   default: 0.0.0.0:5672
    -t --tls-addr  <socket address> address of the TLS listener, requires [tls] in the config
    -H --http      <socket address> address of the health and overview endpoints
    -c --config    <path>           broker configuration file (TOML)
    -h --help                       print this message
"#;

    pub fn instance() -> &'static Self {
        SETTINGS.get_or_init(Self::from_env)
    }

    pub fn try_from_env() -> Result<Self, pico_args::Error> {
        Self::parse(pico_args::Arguments::from_env())
    }

    pub fn parse(mut pargs: pico_args::Arguments) -> Result<Self, pico_args::Error> {
        if pargs.contains(["-h", "--help"]) {
            print!("{}", Self::HELP_STRING);
            std::process::exit(0);
        }

        let addr = pargs
            .opt_value_from_str(["-a", "--addr"])?
            .unwrap_or(SocketAddr::from(([0u8; 4], 5672)));
        let tls_addr = pargs.opt_value_from_str(["-t", "--tls-addr"])?;
        let http_addr = pargs.opt_value_from_str(["-H", "--http"])?;
        let config = pargs.opt_value_from_os_str(["-c", "--config"], |s| {
            Ok::<_, std::convert::Infallible>(PathBuf::from(s))
        })?;

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            return Err(pico_args::Error::ArgumentParsingFailed {
                cause: format!("unexpected arguments: {remaining:?}"),
            });
        }

        Ok(Self {
            addr,
            tls_addr,
            http_addr,
            config,
            started: SystemTime::now(),
        })
    }

    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(settings) => settings,
            Err(error) => {
                eprint!("error: {error}{}", Self::HELP_STRING);
                std::process::exit(1);
            },
        }
    }
}

// Getter functions
impl Settings {
    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn tls_addr(&self) -> Option<&SocketAddr> {
        self.tls_addr.as_ref()
    }

    pub fn http_addr(&self) -> Option<&SocketAddr> {
        self.http_addr.as_ref()
    }

    pub fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    fn parse(args: &[&str]) -> Result<Settings, pico_args::Error> {
        let args = args.iter().map(OsString::from).collect();
        Settings::parse(pico_args::Arguments::from_vec(args))
    }

    #[test]
    fn defaults_to_the_amqp_port() {
        let settings = parse(&[]).unwrap();
        assert_eq!(settings.addr().port(), 5672);
        assert!(settings.tls_addr().is_none());
        assert!(settings.config().is_none());
    }

    #[test]
    fn reads_all_listeners() {
        let settings = parse(&[
            "-a",
            "127.0.0.1:5000",
            "--tls-addr",
            "127.0.0.1:5671",
            "-H",
            "127.0.0.1:15672",
            "-c",
            "warren.toml",
        ])
        .unwrap();

        assert_eq!(settings.addr().port(), 5000);
        assert_eq!(settings.tls_addr().map(|a| a.port()), Some(5671));
        assert_eq!(settings.http_addr().map(|a| a.port()), Some(15672));
        assert_eq!(settings.config(), Some(&PathBuf::from("warren.toml")));
    }

    #[test]
    fn rejects_stray_arguments() {
        assert!(parse(&["--bogus"]).is_err());
    }
}
