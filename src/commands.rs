use std::path::Path;

use anyhow::{bail, Context as _, Result};
use tracing::warn;

use crate::cache::CacheManager;
use crate::client::{NestSession, TargetBound};
use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::model::{HvacMode, Presence, Thermostat};
use crate::oauth::{self, AuthFailure, AuthOutcome, CallbackServer, OAuthClient};
use crate::temperature::{Scale, Temperature};

pub async fn auth_login(ctx: &Context, client_secret: Option<&Path>) -> Result<()> {
    let settings = &ctx.settings;

    if let Some(source) = client_secret {
        // Validate before replacing a working secret
        yup_oauth2::read_application_secret(source)
            .await
            .with_context(|| format!("Could not read client secret {}", source.display()))?;
        std::fs::create_dir_all(&settings.data_dir)?;
        std::fs::copy(source, settings.client_secret_file())?;
    }

    let secret = oauth::load_client_secret(settings).await.with_context(|| {
        format!(
            "No client secret at {}. Run `nest-remote auth login --client-secret <file>`",
            settings.client_secret_file().display()
        )
    })?;
    let oauth = OAuthClient::new(ctx.http.clone(), &secret, settings);

    let server = CallbackServer::bind(settings).await?;
    let state = oauth::new_state();
    let mut tokens = ctx.tokens()?;
    tokens.begin_authorization(&state)?;

    println!("Open this URL in your browser to authorize access:\n");
    println!("  {}\n", oauth.authorization_url(&state));
    println!("Waiting for the callback on {} ...", settings.redirect_uri());

    let outcome = tokio::select! {
        outcome = server.run(oauth, tokens) => outcome?,
        _ = tokio::signal::ctrl_c() => bail!("Authorization cancelled"),
    };

    match outcome {
        AuthOutcome::Authorized { expires_at } => {
            println!("Authorization successful. Token valid until {expires_at}.");
            Ok(())
        }
        AuthOutcome::Failed(failure) => Err(describe_failure(failure)),
    }
}

fn describe_failure(failure: AuthFailure) -> anyhow::Error {
    match failure {
        AuthFailure::StateMismatch => {
            anyhow::anyhow!("Callback did not match this authorization request")
        }
        AuthFailure::MissingCode => anyhow::anyhow!("Callback carried no authorization code"),
        AuthFailure::Denied(reason) => anyhow::anyhow!("Access was not granted: {reason}"),
        AuthFailure::Exchange(e) => anyhow::Error::new(e).context("Token exchange failed"),
        AuthFailure::Save(e) => anyhow::Error::new(e).context("Could not save the access token"),
    }
}

pub fn auth_status(ctx: &Context) -> Result<()> {
    let tokens = ctx.tokens()?;
    match (tokens.is_authorized(), tokens.expiry()) {
        (true, Some(expiry)) => println!("Authorized until {expiry}."),
        (false, Some(expiry)) => println!("Token expired at {expiry}. Run `nest-remote auth login`."),
        _ => println!("Not authorized. Run `nest-remote auth login`."),
    }
    Ok(())
}

pub fn auth_logout(ctx: &Context) -> Result<()> {
    ctx.tokens()?.clear()?;
    println!("Access token removed.");
    Ok(())
}

/// Session plus a cache that has been brought within the passive max age.
async fn fresh(ctx: &Context) -> Result<(NestSession, CacheManager, Config)> {
    let session = ctx.session()?;
    let mut cache = ctx.cache()?;
    cache.ensure_fresh(&session, ctx.settings.cache_max_age).await?;
    // Re-read: a sync may have seeded the device and scale.
    let config = Config::load_or_init(ctx.store.as_ref())?;
    Ok((session, cache, config))
}

fn selected<'a>(cache: &'a CacheManager, config: &Config) -> Result<&'a Thermostat> {
    let Some(device_id) = config.selected_device() else {
        return Err(Error::InvalidInput("No thermostat found on this account".into()).into());
    };
    cache.snapshot().thermostat(device_id).ok_or_else(|| {
        Error::InvalidInput(format!(
            "Selected thermostat {device_id} is not on this account. Run `nest-remote config device <name>`"
        ))
        .into()
    })
}

/// Mark the snapshot stale after a remote write. The write already happened,
/// so a failure here is reported but changes nothing remotely.
fn invalidate(cache: &mut CacheManager) -> Result<()> {
    cache.invalidate().inspect_err(|e| {
        warn!(error = %e, "Could not invalidate cache after a successful write");
    })?;
    Ok(())
}

pub async fn status(ctx: &Context) -> Result<()> {
    let (_, cache, config) = fresh(ctx).await?;
    let thermostat = selected(&cache, &config)?;
    let scale = config.scale();

    println!("{} ({})", thermostat.name_long, thermostat.device_id);
    println!("  Online:   {}", if thermostat.is_online { "yes" } else { "no" });
    println!("  Mode:     {}", thermostat.hvac_mode);
    println!("  Ambient:  {}", thermostat.ambient(scale));
    match thermostat.hvac_mode {
        HvacMode::HeatCool => println!(
            "  Target:   {} - {}",
            thermostat.target_low(scale),
            thermostat.target_high(scale)
        ),
        HvacMode::Eco => println!(
            "  Eco:      {} - {}",
            thermostat.away_low(scale),
            thermostat.away_high(scale)
        ),
        HvacMode::Off => {}
        _ => println!("  Target:   {}", thermostat.target(scale)),
    }
    println!("  Humidity: {:.0}%", thermostat.humidity);
    if let Some(structure) = cache.snapshot().structure_of(thermostat) {
        println!("  Presence: {} ({})", structure.away, structure.name);
    }
    if let Some(synced) = cache.last_sync_time() {
        println!("  Synced:   {synced}");
    }
    Ok(())
}

pub async fn refresh(ctx: &Context) -> Result<()> {
    let session = ctx.session()?;
    let mut cache = ctx.cache()?;
    cache.refresh(&session).await?;

    let snapshot = cache.snapshot();
    println!(
        "Synced {} thermostat(s) in {} structure(s).",
        snapshot.devices.thermostats.len(),
        snapshot.structures.len()
    );
    Ok(())
}

pub async fn list_devices(ctx: &Context) -> Result<()> {
    let (_, cache, config) = fresh(ctx).await?;
    let thermostats = &cache.snapshot().devices.thermostats;
    if thermostats.is_empty() {
        println!("No thermostats found.");
        return Ok(());
    }

    let scale = config.scale();
    for thermostat in thermostats.values() {
        let marker = if config.selected_device() == Some(thermostat.device_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<24} {:<20} {:>8}  {}",
            thermostat.device_id,
            thermostat.name,
            thermostat.ambient(scale).to_string(),
            thermostat.hvac_mode
        );
    }
    Ok(())
}

/// Clap accepts `NaN` and `inf`; neither is a setpoint.
fn finite(value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::InvalidInput(format!("Not a valid temperature: {value}")).into())
    }
}

pub async fn temperature(ctx: &Context, value: Option<f64>) -> Result<()> {
    let value = value.map(finite).transpose()?;
    let (session, mut cache, config) = fresh(ctx).await?;
    let thermostat = selected(&cache, &config)?.clone();
    let scale = config.scale();

    let Some(value) = value else {
        match thermostat.hvac_mode {
            HvacMode::HeatCool => println!(
                "{} - {}",
                thermostat.target_low(scale),
                thermostat.target_high(scale)
            ),
            _ => println!("{}", thermostat.target(scale)),
        }
        return Ok(());
    };

    if matches!(thermostat.hvac_mode, HvacMode::Off | HvacMode::Eco) {
        return Err(Error::InvalidInput(format!(
            "{} is in {} mode; switch to heat, cool, or heat-cool first",
            thermostat.name, thermostat.hvac_mode
        ))
        .into());
    }

    let target = Temperature::new(value, scale);
    let bound = TargetBound::for_mode(thermostat.hvac_mode, target, thermostat.ambient(scale));
    let confirmed = session
        .set_target_temperature(&thermostat.device_id, target, bound)
        .await?;

    match bound {
        TargetBound::Single => println!("Target set to {confirmed}"),
        TargetBound::High => println!("Upper target set to {confirmed}"),
        TargetBound::Low => println!("Lower target set to {confirmed}"),
    }
    invalidate(&mut cache)
}

pub async fn set_range(ctx: &Context, low: f64, high: f64) -> Result<()> {
    let (low, high) = (finite(low)?, finite(high)?);
    if low >= high {
        bail!("Lower target must be below the upper target");
    }
    let (session, mut cache, config) = fresh(ctx).await?;
    let thermostat = selected(&cache, &config)?;
    if thermostat.hvac_mode != HvacMode::HeatCool {
        bail!("{} is in {} mode; a range needs heat-cool", thermostat.name, thermostat.hvac_mode);
    }
    let device_id = thermostat.device_id.clone();

    let scale = config.scale();
    let (low, high) = (Temperature::new(low, scale), Temperature::new(high, scale));
    session.set_target_range(&device_id, low, high).await?;
    println!("Target range set to {low} - {high}");
    invalidate(&mut cache)
}

pub async fn set_mode(ctx: &Context, mode: HvacMode) -> Result<()> {
    let (session, mut cache, config) = fresh(ctx).await?;
    let device_id = selected(&cache, &config)?.device_id.clone();

    let confirmed = session.set_hvac_mode(&device_id, mode).await?;
    println!("Mode set to {confirmed}");
    invalidate(&mut cache)
}

pub async fn set_presence(ctx: &Context, presence: Presence) -> Result<()> {
    let (session, mut cache, config) = fresh(ctx).await?;
    let thermostat = selected(&cache, &config)?;
    let structure_id = thermostat.structure_id.clone();
    if structure_id.is_empty() {
        bail!("{} does not belong to a structure", thermostat.name);
    }

    session.set_presence(&structure_id, presence).await?;
    println!("Presence set to {presence}");
    invalidate(&mut cache)
}

pub async fn config_device(ctx: &Context, key: &str) -> Result<()> {
    let (_, cache, _) = fresh(ctx).await?;
    let Some(thermostat) = cache.snapshot().find_thermostat(key) else {
        return Err(Error::InvalidInput(format!("No thermostat matches '{key}'")).into());
    };

    let device_id = thermostat.device_id.clone();
    Config::update(ctx.store.as_ref(), |config| {
        let changed = config.selected_device_id != device_id;
        config.selected_device_id = device_id.clone();
        changed
    })?;
    println!("Selected {} ({})", thermostat.name_long, thermostat.device_id);
    Ok(())
}

pub fn config_scale(ctx: &Context, scale: Scale) -> Result<()> {
    Config::update(ctx.store.as_ref(), |config| {
        let changed = config.preferred_scale != Some(scale);
        config.preferred_scale = Some(scale);
        changed
    })?;
    println!("Temperatures will be shown in {}", scale.name());
    Ok(())
}
