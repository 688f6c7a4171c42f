//! Coil bench hardware validation
//!
//! Read-only checks against the real instruments named in `config/coil_daq.toml`.
//! The supply output is never enabled and no current is commanded.
//!
//! Run with: cargo test --features hardware_tests --test hardware_bench_validation -- --nocapture

#![cfg(feature = "hardware_tests")]

use anyhow::{Context, Result};
use coil_daq::config::Settings;
use coil_daq::instruments::Instruments;

async fn open_bench() -> Result<(Settings, Instruments)> {
    let settings = Settings::load().context("Failed to load config/coil_daq.toml")?;
    let instruments = Instruments::open(&settings)
        .await
        .context("Failed to open bench instruments")?;
    Ok((settings, instruments))
}

#[tokio::test]
async fn test_all_instruments_identify() -> Result<()> {
    let (_settings, instruments) = open_bench().await?;

    let voltmeter = instruments.voltmeter.identify().await?;
    let supply = instruments.supply.identify().await?;
    println!("Voltmeter: {}", voltmeter);
    println!("Supply: {}", supply);
    assert!(!voltmeter.is_empty());
    assert!(!supply.is_empty());

    instruments.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_readings_are_finite() -> Result<()> {
    let (settings, instruments) = open_bench().await?;

    instruments.voltmeter.configure(&settings.voltmeter).await?;
    let volts = instruments
        .voltmeter
        .read_channel(settings.voltmeter.channel)
        .await?;
    let channels = instruments.digitizer.read_channels().await?;
    let state = instruments.supply.status().await?;
    println!("Channel {}: {:e} V", settings.voltmeter.channel, volts);
    println!("Digitizer: {:?}", channels);
    println!("Supply: {:?}", state);

    assert!(volts.is_finite());
    assert_eq!(channels.len(), settings.digitizer.channels);
    assert!(channels.iter().all(|v| v.is_finite()));
    assert!(state.protection_level.is_finite());

    instruments.close().await?;
    Ok(())
}
