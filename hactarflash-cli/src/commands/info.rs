//! Bundle info and port listing command implementations.

use {
    crate::commands::firmware::FirmwareDir,
    anyhow::{Context, Result},
    console::style,
    hactarflash::{DetectedPort, FirmwareImage, SectorConfig, Target, auto_detect_port, detect_ports},
    std::path::Path,
};

fn port_json(p: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": p.name,
        "device": p.device.name(),
        "known": p.device.is_known(),
        "vid": p.vid,
        "pid": p.pid,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port
            .device
            .is_known()
        {
            format!(
                " [{}]",
                style(
                    port.device
                        .name()
                )
                .yellow()
            )
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

/// One image the bundle would flash.
struct ImageRow {
    target: Target,
    image: FirmwareImage,
}

fn collect_images(bundle: &FirmwareDir) -> Result<Vec<ImageRow>> {
    let mut rows = Vec::new();
    for target in Target::ALL {
        if !bundle.has_target(target) {
            continue;
        }
        let images = bundle
            .images_for(target)
            .with_context(|| format!("cannot load {target} firmware"))?;
        rows.extend(
            images
                .into_iter()
                .map(|image| ImageRow { target, image }),
        );
    }
    Ok(rows)
}

fn sector_json(chip_id: u32, layout: &SectorConfig) -> serde_json::Value {
    serde_json::json!({
        "chip_id": format!("{chip_id:#05x}"),
        "user_start_address": format!("0x{:08X}", layout.user_start_address),
        "sectors": layout.sectors.len(),
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(dir: &Path, json: bool) -> Result<()> {
    let bundle = FirmwareDir::open(dir)
        .with_context(|| format!("failed to load firmware bundle {}", dir.display()))?;
    let rows = collect_images(&bundle)?;

    if json {
        let images: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "target": row.target.name(),
                    "name": row.image.name,
                    "offset": format!("0x{:08X}", row.image.offset),
                    "size": row.image.len(),
                    "md5": row.image.md5_hex(),
                })
            })
            .collect();
        let sectors: Vec<serde_json::Value> = bundle
            .sector_configs()
            .iter()
            .map(|(chip_id, layout)| sector_json(*chip_id, layout))
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "directory": bundle.root().display().to_string(),
                "images": images,
                "sector_configs": sectors,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{} Firmware bundle {}",
        style("📦").cyan(),
        bundle
            .root()
            .display()
    );

    if rows.is_empty() {
        eprintln!("  {}", style("No images found").dim());
    } else {
        println!(
            "  {:<6} {:<16} {:>12} {:>10}  {}",
            style("Target").bold(),
            style("Name").bold(),
            style("Offset").bold(),
            style("Size").bold(),
            style("MD5").bold()
        );
        for row in &rows {
            println!(
                "  {:<6} {:<16} {:>12} {:>10}  {}",
                style(row.target.name()).cyan(),
                row.image.name,
                format!("0x{:08X}", row.image.offset),
                row.image.len(),
                style(row.image.md5_hex()).dim()
            );
        }
    }

    if bundle
        .sector_configs()
        .is_empty()
    {
        println!(
            "\n  Sector layout: built-in STM32F4 ({} sectors)",
            SectorConfig::stm32f4()
                .sectors
                .len()
        );
    } else {
        println!();
        for (chip_id, layout) in bundle.sector_configs() {
            println!(
                "  Chip {chip_id:#05x}: {} sectors from 0x{:08X}",
                layout.sectors.len(),
                layout.user_start_address
            );
        }
    }

    Ok(())
}
