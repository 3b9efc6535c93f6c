mod monitoring;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flashkit::fastboot::FastbootClient;
use flashkit::mtk::{BromClient, DaClient};
use flashkit::ota::{FetchPolicy, OtaSource};
use flashkit::progress::CancelToken;
use flashkit::sprd::{self, FdlClient};
use flashkit::transport::{SerialTransport, UsbBulkTransport, UsbIdentity};
use flashkit::{Error, Result};

#[derive(Parser, Debug)]
#[command(
  author,
  version,
  about = "cross-vendor low-level flashing toolkit: fastboot, mediatek brom/da, spreadtrum fdl, and A/B OTA payloads",
  long_about = None
)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Android Fastboot protocol operations.
  Fastboot {
    #[command(subcommand)]
    action: FastbootAction,
  },
  /// Extract a partition out of a remote A/B OTA `payload.bin`.
  Ota {
    /// URL to payload.bin, or to a ZIP containing it.
    url: String,
    /// Treat `url` as pointing directly at payload.bin, skipping the ZIP walk.
    #[arg(long)]
    direct: bool,
    #[command(subcommand)]
    action: OtaAction,
  },
  /// MediaTek BROM handshake and Download-Agent boot.
  Mtk {
    #[command(subcommand)]
    action: MtkAction,
  },
  /// Spreadtrum/Unisoc FDL handshake and staged bootloader upload.
  Sprd {
    #[command(subcommand)]
    action: SprdAction,
  },
}

#[derive(Subcommand, Debug)]
enum MtkAction {
  /// Handshake with BROM and print the hardware/target-config probe.
  Probe {
    #[arg(default_value = "0x0e8d")]
    vendor_id: String,
    #[arg(default_value = "0x0003")]
    product_id: String,
  },
  /// Boot DA1, sync, boot DA2, then write `image` to `partition`.
  Flash {
    partition: String,
    image: PathBuf,
    da1: PathBuf,
    da1_addr: String,
    da2: PathBuf,
    da2_addr: String,
    #[arg(default_value = "0x0e8d")]
    vendor_id: String,
    #[arg(default_value = "0x0003")]
    product_id: String,
  },
}

#[derive(Subcommand, Debug)]
enum SprdAction {
  /// Connect and read back the chip type over BSL.
  Probe {
    port: String,
    #[arg(default_value_t = 115200)]
    baud_rate: u32,
  },
  /// Upload FDL1+FDL2, then write `image` to `partition`.
  Flash {
    port: String,
    partition: String,
    image: PathBuf,
    fdl1: PathBuf,
    fdl2: PathBuf,
    chip: String,
    #[arg(default_value_t = 115200)]
    baud_rate: u32,
  },
}

#[derive(Subcommand, Debug)]
enum FastbootAction {
  /// Print every `getvar:all` variable the device reports.
  Getvar {
    #[arg(default_value = "0x18d1")]
    vendor_id: String,
    #[arg(default_value = "0x4ee0")]
    product_id: String,
  },
  /// Flash `image` to `partition`, splitting it if it exceeds max-download-size.
  Flash {
    partition: String,
    image: PathBuf,
    #[arg(default_value = "0x18d1")]
    vendor_id: String,
    #[arg(default_value = "0x4ee0")]
    product_id: String,
  },
  Reboot {
    #[arg(default_value = "0x18d1")]
    vendor_id: String,
    #[arg(default_value = "0x4ee0")]
    product_id: String,
  },
}

#[derive(Subcommand, Debug)]
enum OtaAction {
  /// List every partition named in the manifest.
  List,
  /// Extract one partition to a local file.
  Extract { partition: String, output: PathBuf },
}

#[tokio::main]
async fn main() {
  monitoring::init_logger();

  let args = Args::parse();
  let result = match args.command {
    Command::Fastboot { action } => run_fastboot(action),
    Command::Ota { url, direct, action } => run_ota(url, direct, action).await,
    Command::Mtk { action } => run_mtk(action),
    Command::Sprd { action } => run_sprd(action),
  };

  match result {
    Ok(()) => tracing::info!("done!"),
    Err(err) => {
      tracing::error!("failed: {err}");
      std::process::exit(1);
    }
  }
}

fn parse_id(s: &str) -> u16 {
  let s = s.trim_start_matches("0x");
  u16::from_str_radix(s, 16).unwrap_or_else(|_| panic!("invalid hex id {s:?}"))
}

fn run_fastboot(action: FastbootAction) -> Result<()> {
  match action {
    FastbootAction::Getvar { vendor_id, product_id } => {
      let transport = UsbBulkTransport::find_first(parse_id(&vendor_id), parse_id(&product_id))?;
      let mut client = FastbootClient::new(transport);
      let cancel = CancelToken::new();
      let vars = client.getvar_all(&cancel)?;
      for (key, value) in vars {
        println!("{key}: {value}");
      }
      Ok(())
    }
    FastbootAction::Flash { partition, image, vendor_id, product_id } => {
      let transport = UsbBulkTransport::find_first(parse_id(&vendor_id), parse_id(&product_id))?;
      let mut client = FastbootClient::new(transport);
      let cancel = CancelToken::new();
      let data = std::fs::read(&image)?;
      let max_download_size = client
        .getvar("max-download-size")
        .ok()
        .and_then(|s| parse_size(&s))
        .unwrap_or(512 * 1024 * 1024);
      client.flash_image(&partition, &data, max_download_size, &cancel)
    }
    FastbootAction::Reboot { vendor_id, product_id } => {
      let transport = UsbBulkTransport::find_first(parse_id(&vendor_id), parse_id(&product_id))?;
      let mut client = FastbootClient::new(transport);
      client.reboot()
    }
  }
}

/// Parse a `getvar:max-download-size` value, which devices report as a
/// bare decimal or a `0x`-prefixed hex byte count.
fn parse_size(s: &str) -> Option<usize> {
  let s = s.trim();
  if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
    usize::from_str_radix(hex, 16).ok()
  } else {
    s.parse().ok()
  }
}

fn parse_hex_u32(s: &str) -> Result<u32> {
  let s = s.trim_start_matches("0x").trim_start_matches("0X");
  u32::from_str_radix(s, 16).map_err(|_| Error::Format(format!("invalid hex value {s:?}")))
}

fn run_mtk(action: MtkAction) -> Result<()> {
  match action {
    MtkAction::Probe { vendor_id, product_id } => {
      let transport = UsbBulkTransport::find_first(parse_id(&vendor_id), parse_id(&product_id))?;
      let mut brom = BromClient::new(transport, Duration::from_secs(10));
      brom.handshake()?;
      let info = brom.probe()?;
      println!("hw_code: {:#06x}", info.hw_code);
      println!("target_config: {:#010x}", info.target_config);
      if let Some(chip) = &info.chip {
        println!("chip: {}", chip.name);
      }
      Ok(())
    }
    MtkAction::Flash { partition, image, da1, da1_addr, da2, da2_addr, vendor_id, product_id } => {
      let vendor_id = parse_id(&vendor_id);
      let product_id = parse_id(&product_id);
      let transport = UsbBulkTransport::find_first(vendor_id, product_id)?;
      let mut brom = BromClient::new(transport, Duration::from_secs(10));
      brom.handshake()?;
      brom.probe()?;

      let da1_data = std::fs::read(&da1)?;
      let da1_addr = parse_hex_u32(&da1_addr)?;
      let cancel = CancelToken::new();
      let new_identity = UsbIdentity { vendor_id, product_id };
      let transport =
        brom.upload_da1(da1_addr, da1_data.len() as u32, &da1_data, new_identity, Duration::from_secs(15), &cancel)?;

      let mut da_client = DaClient::new(transport);
      da_client.sync("emmc", None)?;

      let da2_data = std::fs::read(&da2)?;
      let da2_addr = parse_hex_u32(&da2_addr)?;
      da_client.boot_to(&da2_data, da2_addr, &cancel)?;

      let image_data = std::fs::read(&image)?;
      da_client.write_partition(&partition, &image_data, &cancel)
    }
  }
}

fn run_sprd(action: SprdAction) -> Result<()> {
  match action {
    SprdAction::Probe { port, baud_rate } => {
      let transport = SerialTransport::open(&port, baud_rate, Duration::from_secs(10))?;
      let mut client = FdlClient::new(transport, Duration::from_secs(10));
      client.connect()?;
      let chip_type = client.read_chip_type()?;
      println!("chip_type: {chip_type:#010x}");
      Ok(())
    }
    SprdAction::Flash { port, partition, image, fdl1, fdl2, chip, baud_rate } => {
      let chip_id = parse_hex_u32(&chip)?;
      let chip = sprd::chips::lookup(chip_id).ok_or_else(|| Error::NotFound)?;

      let transport = SerialTransport::open(&port, baud_rate, Duration::from_secs(10))?;
      let mut client = FdlClient::new(transport, Duration::from_secs(10));
      let cancel = CancelToken::new();

      let fdl1_data = std::fs::read(&fdl1)?;
      client.upload_fdl1(&chip, &fdl1_data, &cancel)?;

      let fdl2_data = std::fs::read(&fdl2)?;
      client.upload_fdl2(&chip, &fdl2_data, &cancel)?;

      let image_data = std::fs::read(&image)?;
      sprd::write_partition_image(&mut client, &partition, &image_data, &cancel)
    }
  }
}

async fn run_ota(url: String, direct: bool, action: OtaAction) -> Result<()> {
  let source = if direct { OtaSource::open_payload(&url).await? } else { OtaSource::open_zip(&url).await? };

  match action {
    OtaAction::List => {
      for name in source.partition_names() {
        println!("{name}");
      }
      Ok(())
    }
    OtaAction::Extract { partition, output } => {
      let cancel = CancelToken::new();
      source
        .extract_to_file(&partition, &output, &FetchPolicy::default(), &cancel, None)
        .await
    }
  }
}
