#[derive(Debug, Args)]
struct CommonOpt {
    /// Path to the server's configuration file.
    #[clap(short, long = "config", env = "VIGIL_CONFIG", default_value = "/etc/vigil/server.toml")]
    config_path: PathBuf,
}

#[derive(Debug, Parser)]
#[command(name = "vigild")]
struct VigildParser {
    #[command(subcommand)]
    commands: VigildOpt,
}

#[derive(Debug, Subcommand)]
enum VigildOpt {
    #[clap(name = "server")]
    /// Start the IAM portal server
    Server(CommonOpt),
    #[clap(name = "configtest")]
    /// Test the server configuration, without starting network listeners.
    ConfigTest(CommonOpt),
    #[clap(name = "version")]
    /// Print the program version and exit
    Version,
}
