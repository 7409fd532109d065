//! Argument parsing for running from the command line

use std::path::PathBuf;

use adc_streamer::{
    cycle_gap_for_rate, loopback::VRING_DEPTH, packer::SendFailurePolicy, protocol::StartConfig,
    sim::Waveform,
};
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Comma separated ADC lanes to capture, in output order
    #[clap(short, long, value_delimiter = ',', default_value = "0")]
    pub channels: Vec<u8>,
    /// ADC clock divider, 0 is the fastest conversion
    #[clap(long, default_value_t = 0)]
    pub clock_divider: u32,
    /// Hardware averaging exponent (2^n conversions per result)
    #[clap(short, long, default_value_t = 0)]
    #[clap(value_parser = clap::value_parser!(u32).range(0..=4))]
    pub averaging: u32,
    /// Upper bound on records per frame, 0 fills each frame
    #[clap(short, long, default_value_t = 0)]
    pub max_records: u32,
    /// Target sample sets per second, 0 captures as fast as possible
    #[clap(short, long, default_value_t = 0)]
    pub rate: u32,
    /// Stop after this many frames, 0 runs until interrupted
    #[clap(short, long, default_value_t = 100)]
    pub frames: u64,
    /// Keep buffers whose send failed instead of reclaiming them
    #[clap(long)]
    pub pin_slots: bool,
    /// Directory to write captured voltages to (raw native endian f32)
    #[clap(short, long)]
    pub output_dir: Option<PathBuf>,
    /// Simulated input: constant:<code>, tagged, ramp:<step> or sine:<period>
    #[clap(short, long, default_value = "sine:1000", value_parser = parse_waveform)]
    pub waveform: Waveform,
    /// Messages buffered in each direction of the channel
    #[clap(long, default_value_t = VRING_DEPTH)]
    pub vring_depth: usize,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn start_config(&self) -> StartConfig {
        StartConfig::new(&self.channels)
            .with_clock_divider(self.clock_divider)
            .with_averaging(self.averaging)
            .with_max_records(self.max_records)
            .with_min_cycle_gap(cycle_gap_for_rate(self.rate))
    }

    pub fn policy(&self) -> SendFailurePolicy {
        if self.pin_slots {
            SendFailurePolicy::PinSlot
        } else {
            SendFailurePolicy::ReleaseSlot
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn parse_waveform(s: &str) -> Result<Waveform, String> {
    let (kind, arg) = match s.split_once(':') {
        Some((kind, arg)) => (kind, Some(arg)),
        None => (s, None),
    };
    let number = |what: &str| -> Result<u32, String> {
        arg.ok_or_else(|| format!("{} needs a value, e.g. {}:100", what, what))?
            .parse()
            .map_err(|_| format!("Invalid {} value", what))
    };
    match kind {
        "constant" => {
            let code = number("constant")?;
            if code > 4095 {
                return Err("Codes are 12 bits".to_string());
            }
            Ok(Waveform::Constant(code as u16))
        }
        "tagged" => Ok(Waveform::LaneTagged),
        "ramp" => Ok(Waveform::Ramp {
            step: number("ramp")?.min(u16::MAX as u32) as u16,
        }),
        "sine" => Ok(Waveform::Sine {
            period: number("sine")?,
        }),
        _ => Err(format!("Unknown waveform {}", kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_waveform() {
        assert_eq!(parse_waveform("constant:12"), Ok(Waveform::Constant(12)));
        assert_eq!(parse_waveform("tagged"), Ok(Waveform::LaneTagged));
        assert_eq!(parse_waveform("ramp:3"), Ok(Waveform::Ramp { step: 3 }));
        assert_eq!(parse_waveform("sine:50"), Ok(Waveform::Sine { period: 50 }));
        assert!(parse_waveform("constant:5000").is_err());
        assert!(parse_waveform("sine").is_err());
        assert!(parse_waveform("square:2").is_err());
    }

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from(["adc_streamer", "-c", "3,1,5", "-r", "1000", "-m", "4"]);
        let config = args.start_config();
        assert_eq!(config.channels(), &[3, 1, 5]);
        assert_eq!(config.min_cycle_gap, 200_000);
        assert_eq!(config.max_records_per_frame, 4);
        assert!(config.validate().is_ok());
        assert_eq!(args.policy(), SendFailurePolicy::ReleaseSlot);
    }
}
