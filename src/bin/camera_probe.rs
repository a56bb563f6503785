//! camera_probe - report what camerad would pick on this host
//!
//! Lists the capture nodes in the order `CameraID` indexes them and checks
//! whether the hardware H.264 encoder answers under its expected name.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use camera_streamer::camera::{self, v4l2};
use camera_streamer::encoder::{select_backend, Backend, CodecChoice};
use camera_streamer::DaemonConfig;

#[derive(Parser, Debug)]
#[command(
    name = "camera_probe",
    about = "List selectable cameras and detect the hardware encoder"
)]
struct Args {
    /// JSON host configuration
    #[arg(long, env = "CAMERAD_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera index to resolve, as sent in the CameraID parameter
    #[arg(long, default_value_t = 0)]
    camera_id: u32,

    /// Encoder node to probe instead of the configured one
    #[arg(long, value_name = "PATH")]
    encoder_device: Option<String>,

    /// Card name the hardware encoder must report
    #[arg(long, value_name = "NAME")]
    encoder_model: Option<String>,

    /// Codec setting to resolve (auto|hardwareH264|softwareH264)
    #[arg(long, default_value = "auto")]
    codec: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut config = DaemonConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.encoder_device {
        config.encoder.device = device;
    }
    if let Some(model) = args.encoder_model {
        config.encoder.expected_model = model;
    }

    let all = v4l2::enumerate()?;
    let skipped = all.iter().filter(|camera| camera.id.contains("/usb")).count();
    let candidates = camera::selection_order(all);
    if candidates.is_empty() {
        println!("no selectable cameras");
    }
    for (index, camera) in candidates.iter().enumerate() {
        let marker = if index as u32 == args.camera_id { "*" } else { " " };
        println!(
            "{} {:>2}  {}  {}",
            marker,
            index,
            camera.node.display(),
            camera.id
        );
    }
    if skipped > 0 {
        println!("({} USB camera(s) skipped)", skipped);
    }
    if args.camera_id as usize >= candidates.len() {
        println!("CameraID {}: selected camera is not available", args.camera_id);
    }

    let detected = config.encoder.hardware_available();
    println!(
        "hardware encoder {} ({}): {}",
        config.encoder.device,
        config.encoder.expected_model,
        if detected { "detected" } else { "not detected" }
    );
    let choice = CodecChoice::from_name(&args.codec)?;
    let backend = select_backend(choice, || detected);
    println!(
        "codec {} resolves to {}",
        args.codec,
        match backend {
            Backend::Hardware => "hardware H.264",
            Backend::Software => "software H.264",
        }
    );
    Ok(())
}
