//! Command-line argument parsing for rtp-playout

/// Parse command line arguments
#[derive(Debug, Default)]
pub struct Args {
    pub validate: bool,
    pub help: bool,
    /// Stop after this many seconds instead of waiting for Ctrl-C
    pub duration_secs: Option<u64>,
    /// Overrides RTP_PORT
    pub port: Option<u16>,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

/// Parse an explicit argument list; `args[0]` is the program name
pub fn parse_args_from(args: &[String]) -> Args {
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            "--duration" => {
                if i + 1 < args.len() {
                    i += 1;
                    result.duration_secs = args[i].parse().ok();
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    i += 1;
                    result.port = args[i].parse().ok();
                }
            }
            _ => {}
        }
        i += 1;
    }

    result
}

pub fn print_help() {
    println!("rtp-playout - RTP receive stream with adaptive jitter buffer\n");
    println!("USAGE:");
    println!("    rtp-playout [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --validate              Validate configuration and exit");
    println!("    --port PORT             UDP port to receive RTP on (overrides RTP_PORT)");
    println!("    --duration SECS         Stop after SECS seconds");
    println!("    --help, -h              Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    RTP_BIND_ADDR, RTP_PORT, JITTER_TARGET_MS, JITTER_CAPACITY,");
    println!("    CLOCK_RATE, PLAYOUT_INTERVAL_MS, HEALTH_PORT (a .env file is read if present)");
}
