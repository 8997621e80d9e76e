//! sling cli and tracing configuration

pub mod cli {
    //! Parse from either cli or env var
    use std::{path::PathBuf, time::Duration};

    use anyhow::Result;
    pub use clap::Parser;
    use clap::{Args, Subcommand};
    use config::{LogFormat, SlingConfig, TransportKind};
    use transport::Timeouts;

    use crate::plan::{RateLimits, SendSpec};

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "sling-worker";

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "sling", bin_name = "sling", version, long_about = None)]
    /// sling network traffic emulator. Sends files to an endpoint with
    /// bounded concurrency, rate limits and delays between requests.
    pub struct Cli {
        /// path to sling's config, built-in defaults are used when unset
        #[clap(long, env = "SLINGCONFIG", value_parser, global = true)]
        pub config: Option<PathBuf>,
        /// log output level, any valid RUST_LOG directive
        #[clap(long, env = "SLING_LOG", value_parser, global = true)]
        pub log_level: Option<String>,
        /// console output level
        #[clap(long, value_parser, global = true)]
        pub con_level: Option<String>,
        /// console prints the message only, without timestamp, level or fields
        #[clap(long, global = true)]
        pub con_flat: bool,
        /// log format: standard, json or pretty
        #[clap(long, env = "LOG_FORMAT", value_parser, global = true)]
        pub log_format: Option<LogFormat>,
        /// number of tokio worker threads, defaults to the number of cpus
        #[clap(long, env = "SLING_THREADS", value_parser, global = true)]
        pub threads: Option<usize>,
        /// worker thread name
        #[clap(long, value_parser, default_value = DEFAULT_THREAD_NAME, global = true)]
        pub thread_name: String,
        /// what to do
        #[clap(subcommand)]
        pub command: Command,
    }

    impl Cli {
        /// Fold the global flags into the loaded config
        pub fn apply_globals(&self, cfg: &mut SlingConfig) {
            if let Some(level) = &self.log_level {
                cfg.log.level = level.clone();
            }
            if let Some(level) = &self.con_level {
                cfg.console.level = level.clone();
            }
            if self.con_flat {
                cfg.console.flat = true;
            }
            if let Some(format) = self.log_format {
                cfg.log.format = format;
            }
        }
    }

    /// top level commands
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// send requests
        #[clap(subcommand)]
        Request(RequestCommand),
        /// inspect configuration
        #[clap(subcommand)]
        Config(ConfigCommand),
        /// inspect or clean up logs and saved artifacts
        #[clap(subcommand)]
        Log(LogCommand),
    }

    /// `sling request ..`
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum RequestCommand {
        /// send requests from a file or directory to the endpoint
        Send(SendArgs),
    }

    /// `sling config ..`
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum ConfigCommand {
        /// print the effective configuration as YAML
        View,
    }

    /// `sling log ..`
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum LogCommand {
        /// print the log file
        View,
        /// truncate the log file and empty the request/response save directories
        Clean,
    }

    /// Flags for `sling request send`. A flag given on the command line
    /// overrides the config value.
    #[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
    pub struct SendArgs {
        /// file path or file name to send, selects a single send
        #[clap(short = 'f', long)]
        pub file: Option<PathBuf>,
        /// directory to send files from, selects a multi send when no file is given
        #[clap(short = 'd', long)]
        pub dir: Option<PathBuf>,
        /// file name matching wildcard
        #[clap(short = 'w', long)]
        pub wildcard: Option<String>,
        /// send repeat count, 0 sends every matched file once
        #[clap(short = 'r', long)]
        pub repeat: Option<u64>,
        /// number of concurrent connections
        #[clap(short = 'n', long)]
        pub cxn_num: Option<u32>,
        /// limit the number of concurrent connections to --cxn-num
        #[clap(short = 'l', long, num_args = 0..=1, default_missing_value = "true")]
        pub cxn_lim: Option<bool>,
        /// delay after each request, milliseconds
        #[clap(short = 'e', long)]
        pub sleep_ms: Option<u64>,
        /// send rate per second, 0 is unlimited
        #[clap(short = 's', long)]
        pub rate_sec: Option<u32>,
        /// send rate per minute, 0 is unlimited
        #[clap(short = 'm', long)]
        pub rate_min: Option<u32>,
        /// overall request timeout, seconds
        #[clap(short = 't', long)]
        pub tmo_sec: Option<u64>,
        /// dial timeout, seconds
        #[clap(short = 'u', long)]
        pub tmo_cxn: Option<u64>,
        /// read timeout, seconds
        #[clap(short = 'v', long)]
        pub tmo_rd_s: Option<u64>,
        /// write timeout, seconds
        #[clap(short = 'x', long)]
        pub tmo_wr_s: Option<u64>,
        /// active endpoint index in the config, zero-based
        #[clap(short = 'i', long)]
        pub endpoint: Option<usize>,
        /// endpoint IP, DNS name, or HTTP address
        #[clap(short = 'a', long)]
        pub address: Option<String>,
        /// endpoint port number
        #[clap(short = 'p', long)]
        pub port: Option<u16>,
        /// network client type, tcp or http_post
        #[clap(short = 'c', long)]
        pub clt_type: Option<TransportKind>,
        /// save requests
        #[clap(short = 'q', long, num_args = 0..=1, default_missing_value = "true")]
        pub save_req: Option<bool>,
        /// directory to save requests
        #[clap(short = 'k', long)]
        pub save_req_dir: Option<PathBuf>,
        /// save responses
        #[clap(short = 'o', long, num_args = 0..=1, default_missing_value = "true")]
        pub save_res: Option<bool>,
        /// directory to save responses
        #[clap(short = 'j', long)]
        pub save_res_dir: Option<PathBuf>,
        /// write histogram to the log
        #[clap(short = 'g', long, num_args = 0..=1, default_missing_value = "true")]
        pub log_his: Option<bool>,
        /// write histogram to the console
        #[clap(short = 'y', long, num_args = 0..=1, default_missing_value = "true")]
        pub con_his: Option<bool>,
        /// print the run report as JSON
        #[clap(long)]
        pub json: bool,
        /// write prometheus metrics to this file after the run
        #[clap(long)]
        pub metrics_out: Option<PathBuf>,
    }

    impl SendArgs {
        /// Merge flags over `cfg`. Selecting an endpoint by index updates `cfg`.
        pub fn to_spec(&self, cfg: &mut SlingConfig) -> Result<SendSpec> {
            if let Some(index) = self.endpoint {
                cfg.set_active_endpoint(index)?;
            }
            let mut endpoint = cfg.active_endpoint().clone();
            if let Some(address) = &self.address {
                endpoint.address = address.clone();
            }
            if let Some(port) = self.port {
                endpoint.port = port;
            }
            if let Some(kind) = self.clt_type {
                endpoint.kind = kind;
            }

            // a configured file only applies when no directory was requested
            let file = match (&self.file, &self.dir) {
                (Some(file), _) => Some(file.clone()),
                (None, None) => cfg.file.clone(),
                (None, Some(_)) => None,
            };
            let t = &cfg.throttle;
            let save_req = self.save_req.unwrap_or(cfg.save_req);
            let save_res = self.save_res.unwrap_or(cfg.save_res);

            Ok(SendSpec {
                file,
                dir: self.dir.clone().or_else(|| cfg.dir.clone()),
                wildcard: self.wildcard.clone().unwrap_or_else(|| cfg.wildcard.clone()),
                repeat: self.repeat,
                default_repeat: cfg.repeat,
                concurrency: self.cxn_num.unwrap_or(t.cxn_num),
                cxn_lim: self.cxn_lim.unwrap_or(t.cxn_lim),
                delay: Duration::from_millis(self.sleep_ms.unwrap_or(t.sleep_ms)),
                rate: RateLimits {
                    per_second: self.rate_sec.unwrap_or(t.rate_sec),
                    per_minute: self.rate_min.unwrap_or(t.rate_min),
                },
                endpoint,
                timeouts: Timeouts {
                    overall: Timeouts::secs(self.tmo_sec.unwrap_or(t.tmo_sec)),
                    connect: Timeouts::secs(self.tmo_cxn.unwrap_or(t.tmo_cxn)),
                    read: Timeouts::secs(self.tmo_rd_s.unwrap_or(t.tmo_rd_s)),
                    write: Timeouts::secs(self.tmo_wr_s.unwrap_or(t.tmo_wr_s)),
                },
                save_req_dir: save_req.then(|| {
                    self.save_req_dir
                        .clone()
                        .unwrap_or_else(|| cfg.save_req_dir.clone())
                }),
                save_res_dir: save_res.then(|| {
                    self.save_res_dir
                        .clone()
                        .unwrap_or_else(|| cfg.save_res_dir.clone())
                }),
            })
        }

        /// should the run histogram go to the log
        pub fn log_histogram(&self, cfg: &SlingConfig) -> bool {
            self.log_his.unwrap_or(cfg.log.histogram)
        }

        /// should the run histogram go to the console
        pub fn console_histogram(&self, cfg: &SlingConfig) -> bool {
            self.con_his.unwrap_or(cfg.console.histogram)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn send_args(args: &[&str]) -> SendArgs {
            let cli = Cli::try_parse_from(
                ["sling", "request", "send"].iter().chain(args.iter()),
            )
            .expect("cli parse");
            match cli.command {
                Command::Request(RequestCommand::Send(args)) => args,
                other => panic!("unexpected command {other:?}"),
            }
        }

        #[test]
        fn test_short_flags() {
            let args = send_args(&[
                "-f", "a.dat", "-r", "5", "-n", "3", "-l", "-s", "10", "-m", "100", "-t", "2",
                "-c", "http_post", "-q", "-y", "false",
            ]);
            assert_eq!(args.file, Some(PathBuf::from("a.dat")));
            assert_eq!(args.repeat, Some(5));
            assert_eq!(args.cxn_num, Some(3));
            assert_eq!(args.cxn_lim, Some(true));
            assert_eq!(args.rate_sec, Some(10));
            assert_eq!(args.rate_min, Some(100));
            assert_eq!(args.tmo_sec, Some(2));
            assert_eq!(args.clt_type, Some(TransportKind::HttpPost));
            assert_eq!(args.save_req, Some(true));
            assert_eq!(args.con_his, Some(false));
            assert_eq!(args.save_res, None);
        }

        #[test]
        fn test_flags_override_config() {
            let mut cfg = SlingConfig::default();
            cfg.throttle.rate_sec = 50;
            cfg.throttle.tmo_sec = 9;
            cfg.repeat = 3;
            cfg.save_res = true;
            let spec = send_args(&["-d", "data", "-s", "5", "-a", "example.com", "-p", "1234"])
                .to_spec(&mut cfg)
                .unwrap();
            assert_eq!(spec.dir, Some(PathBuf::from("data")));
            assert_eq!(spec.file, None);
            assert_eq!(spec.repeat, None);
            assert_eq!(spec.default_repeat, 3);
            assert_eq!(spec.rate.per_second, 5);
            assert_eq!(spec.timeouts.overall, Some(Duration::from_secs(9)));
            assert_eq!(spec.timeouts.connect, None);
            assert_eq!(spec.endpoint.address, "example.com");
            assert_eq!(spec.endpoint.port, 1234);
            assert_eq!(spec.save_req_dir, None);
            assert_eq!(spec.save_res_dir, Some(cfg.save_res_dir.clone()));
        }

        #[test]
        fn test_configured_file_ignored_for_explicit_dir() {
            let mut cfg = SlingConfig::default();
            cfg.file = Some(PathBuf::from("cfg.dat"));
            let spec = send_args(&["-d", "data"]).to_spec(&mut cfg).unwrap();
            assert_eq!(spec.file, None);
            let spec = send_args(&[]).to_spec(&mut cfg).unwrap();
            assert_eq!(spec.file, Some(PathBuf::from("cfg.dat")));
        }

        #[test]
        fn test_endpoint_index() {
            let mut cfg = SlingConfig::default();
            cfg.endpoints.push(config::Endpoint {
                address: "10.0.0.2".to_owned(),
                port: 80,
                kind: TransportKind::HttpPost,
            });
            let spec = send_args(&["-i", "1"]).to_spec(&mut cfg).unwrap();
            assert_eq!(spec.endpoint.kind, TransportKind::HttpPost);
            assert_eq!(cfg.endpoint_index, 1);
            assert!(send_args(&["-i", "7"]).to_spec(&mut cfg).is_err());
        }

        #[test]
        fn test_globals() {
            let cli = Cli::try_parse_from([
                "sling",
                "--log-level",
                "debug",
                "--con-flat",
                "--log-format",
                "json",
                "config",
                "view",
            ])
            .expect("cli parse");
            assert_eq!(cli.command, Command::Config(ConfigCommand::View));
            let mut cfg = SlingConfig::default();
            cli.apply_globals(&mut cfg);
            assert_eq!(cfg.log.level, "debug");
            assert_eq!(cfg.log.format, LogFormat::Json);
            assert!(cfg.console.flat);
            assert_eq!(cfg.console.level, "info");
        }
    }
}

pub mod trace {
    //! tracing configuration
    //!
    //! Two sinks: the log (a file, or stderr) receives every event at the log
    //! level, the console (stdout) receives only events emitted with the
    //! [`CONSOLE`] target at the console level.
    use std::{
        fmt::{self, Write as _},
        fs::OpenOptions,
        path::PathBuf,
        str::FromStr,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use anyhow::{Context, Result};
    use config::{LogFormat, SlingConfig};
    use tracing::{Event, Subscriber, field::Field};
    use tracing_subscriber::{
        Layer, Registry,
        field::Visit,
        filter::{EnvFilter, LevelFilter, Targets},
        fmt::{
            self as tfmt, FmtContext,
            format::{Format, FormatEvent, FormatFields, PrettyFields, Writer},
            writer::BoxMakeWriter,
        },
        prelude::__tracing_subscriber_SubscriberExt,
        registry::LookupSpan,
        reload,
        util::SubscriberInitExt,
    };

    /// target for events that are also shown on the console
    pub const CONSOLE: &str = "sling_core::console";

    type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

    /// Configuration for both sinks
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Config {
        /// log sink filter, any valid RUST_LOG directive
        pub log_level: String,
        /// log sink format
        pub log_format: LogFormat,
        /// log file, stderr when unset
        pub log_file: Option<PathBuf>,
        /// console level
        pub console_level: String,
        /// console prints the message only
        pub console_flat: bool,
    }

    impl From<&SlingConfig> for Config {
        fn from(cfg: &SlingConfig) -> Self {
            Self {
                log_level: cfg.log.level.clone(),
                log_format: cfg.log.format,
                log_file: cfg.log.file.clone(),
                console_level: cfg.console.level.clone(),
                console_flat: cfg.console.flat,
            }
        }
    }

    /// Runtime handle to change levels after init
    #[derive(Debug, Clone)]
    pub struct TraceHandle {
        log: reload::Handle<EnvFilter, Registry>,
        console: reload::Handle<Targets, Registry>,
        flat: Arc<AtomicBool>,
    }

    impl TraceHandle {
        /// change the log sink filter
        pub fn set_log_level(&self, level: &str) -> Result<()> {
            self.log.reload(log_filter(level)?)?;
            Ok(())
        }

        /// change the console level
        pub fn set_console_level(&self, level: &str) -> Result<()> {
            self.console.reload(console_filter(level)?)?;
            Ok(())
        }

        /// toggle message-only console output
        pub fn set_console_flat(&self, flat: bool) {
            self.flat.store(flat, Ordering::Relaxed);
        }
    }

    fn log_filter(level: &str) -> Result<EnvFilter> {
        Ok(EnvFilter::try_new(level)
            .or_else(|_| EnvFilter::try_new("info"))?
            .add_directive("hyper=off".parse()?))
    }

    fn console_filter(level: &str) -> Result<Targets> {
        let level = LevelFilter::from_str(level)
            .with_context(|| format!("invalid console level {level:?}"))?;
        Ok(Targets::new().with_target(CONSOLE, level))
    }

    impl Config {
        /// Install the global subscriber
        pub fn init(&self) -> Result<TraceHandle> {
            let log_writer = match &self.log_file {
                Some(path) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .with_context(|| format!("failed to open log file {}", path.display()))?;
                    BoxMakeWriter::new(Mutex::new(file))
                }
                None => BoxMakeWriter::new(std::io::stderr),
            };
            let (layers, handle) = self.layers(log_writer, BoxMakeWriter::new(std::io::stdout))?;
            tracing_subscriber::registry().with(layers).try_init()?;
            Ok(handle)
        }

        /// Build both sinks writing to the given writers
        pub fn layers(
            &self,
            log_writer: BoxMakeWriter,
            console_writer: BoxMakeWriter,
        ) -> Result<(Vec<BoxedLayer>, TraceHandle)> {
            let (log_filter, log) = reload::Layer::new(log_filter(&self.log_level)?);
            let (console_filter, console) = reload::Layer::new(console_filter(&self.console_level)?);
            let flat = Arc::new(AtomicBool::new(self.console_flat));
            let ansi = self.log_file.is_none();

            let log_layer = match self.log_format {
                LogFormat::Json => tfmt::layer()
                    .json()
                    .with_writer(log_writer)
                    .with_filter(log_filter)
                    .boxed(),
                LogFormat::Pretty => tfmt::layer()
                    .event_format(Format::default().pretty().with_source_location(false))
                    .fmt_fields(PrettyFields::new())
                    .with_ansi(ansi)
                    .with_writer(log_writer)
                    .with_filter(log_filter)
                    .boxed(),
                LogFormat::Standard => tfmt::layer()
                    .with_ansi(ansi)
                    .with_writer(log_writer)
                    .with_filter(log_filter)
                    .boxed(),
            };
            let console_layer = tfmt::layer()
                .event_format(ConsoleFormat {
                    flat: flat.clone(),
                    full: Format::default(),
                })
                .with_writer(console_writer)
                .with_filter(console_filter)
                .boxed();

            Ok((
                vec![log_layer, console_layer],
                TraceHandle { log, console, flat },
            ))
        }
    }

    /// full format, or just the message when flat
    struct ConsoleFormat {
        flat: Arc<AtomicBool>,
        full: Format,
    }

    impl<S, N> FormatEvent<S, N> for ConsoleFormat
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        N: for<'a> FormatFields<'a> + 'static,
    {
        fn format_event(
            &self,
            ctx: &FmtContext<'_, S, N>,
            mut writer: Writer<'_>,
            event: &Event<'_>,
        ) -> fmt::Result {
            if !self.flat.load(Ordering::Relaxed) {
                return self.full.format_event(ctx, writer, event);
            }
            let mut visitor = MessageVisitor {
                writer: &mut writer,
                result: Ok(()),
            };
            event.record(&mut visitor);
            visitor.result?;
            writeln!(writer)
        }
    }

    struct MessageVisitor<'a, 'w> {
        writer: &'a mut Writer<'w>,
        result: fmt::Result,
    }

    impl Visit for MessageVisitor<'_, '_> {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.result = write!(self.writer, "{value:?}");
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use std::io;

        use tracing::{debug, info, warn};
        use tracing_subscriber::fmt::MakeWriter;

        use super::*;

        #[derive(Clone, Default)]
        struct Buf(Arc<Mutex<Vec<u8>>>);

        impl Buf {
            fn text(&self) -> String {
                String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
            }
        }

        impl io::Write for Buf {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl<'a> MakeWriter<'a> for Buf {
            type Writer = Buf;
            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        fn config(flat: bool) -> Config {
            Config {
                log_level: "info".to_owned(),
                log_format: LogFormat::Standard,
                log_file: Some(PathBuf::from("unused")),
                console_level: "info".to_owned(),
                console_flat: flat,
            }
        }

        #[test]
        fn test_console_only_gets_console_target() {
            let (log, con) = (Buf::default(), Buf::default());
            let (layers, _handle) = config(false)
                .layers(BoxMakeWriter::new(log.clone()), BoxMakeWriter::new(con.clone()))
                .unwrap();
            let subscriber = tracing_subscriber::registry().with(layers);
            tracing::subscriber::with_default(subscriber, || {
                info!(target: CONSOLE, request_id = 1, "request sent successfully");
                info!("internal detail");
            });
            let (log, con) = (log.text(), con.text());
            assert!(log.contains("request sent successfully"));
            assert!(log.contains("internal detail"));
            assert!(con.contains("request sent successfully"));
            assert!(!con.contains("internal detail"));
        }

        #[test]
        fn test_flat_and_reload() {
            let (log, con) = (Buf::default(), Buf::default());
            let (layers, handle) = config(true)
                .layers(BoxMakeWriter::new(log.clone()), BoxMakeWriter::new(con.clone()))
                .unwrap();
            let subscriber = tracing_subscriber::registry().with(layers);
            tracing::subscriber::with_default(subscriber, || {
                info!(target: CONSOLE, request_id = 1, "flat line");
                debug!(target: CONSOLE, "hidden debug");
                handle.set_console_level("debug").unwrap();
                handle.set_console_flat(false);
                debug!(target: CONSOLE, request_id = 2, "shown debug");
                handle.set_log_level("warn").unwrap();
                info!("dropped by log");
                warn!("kept by log");
            });
            let (log, con) = (log.text(), con.text());
            assert!(con.starts_with("flat line\n"), "{con}");
            assert!(!con.contains("hidden debug"));
            assert!(con.contains("shown debug"));
            assert!(!log.contains("dropped by log"));
            assert!(log.contains("kept by log"));
        }

        #[test]
        fn test_bad_console_level() {
            assert!(console_filter("loud").is_err());
        }
    }
}
