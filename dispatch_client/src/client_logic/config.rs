use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use lib_dispatch::{DispatchConfig, Identity, LatLng, NewRide, Place, UserRole, VehicleType};

/// Parses `"lat,lng"` into a coordinate.
pub fn parse_lat_lng(s: &str) -> Result<LatLng, String> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| format!("expected 'lat,lng', got '{}'", s))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("bad latitude: {}", e))?;
    let lng: f64 = lng.trim().parse().map_err(|e| format!("bad longitude: {}", e))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(format!("coordinate out of range: {},{}", lat, lng));
    }
    Ok(LatLng::new(lat, lng))
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Ride-dispatch client: connects as a rider or driver and follows rides", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DISPATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DISPATCH_ROLE", help = "Which side of the ride this device plays (rider or driver).")]
    pub role: Option<UserRole>,

    #[clap(long, env = "DISPATCH_USER_ID", help = "User id registered on the push channel.")]
    pub user_id: Option<String>,

    #[clap(long, env = "DISPATCH_WS_URL", help = "Push channel WebSocket URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "DISPATCH_API_URL", help = "Base URL of the ride HTTP API.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "DISPATCH_AUTH_TOKEN", hide_env_values = true, help = "Bearer token for the ride HTTP API.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "DISPATCH_OUTBOX_PATH", help = "File holding ride requests queued while offline.")]
    pub outbox_path: Option<PathBuf>,

    #[clap(long, value_parser = parse_lat_lng, help = "Current device position as 'lat,lng'.")]
    pub position: Option<LatLng>,

    #[clap(long, value_parser = parse_lat_lng, help = "Rider only: request a ride from this 'lat,lng'.")]
    pub pickup: Option<LatLng>,

    #[clap(long, value_parser = parse_lat_lng, help = "Rider only: destination of the requested ride as 'lat,lng'.")]
    pub destination: Option<LatLng>,

    #[clap(long, help = "Rider only: quoted fare for the requested ride.")]
    pub fare_estimate: Option<f64>,

    #[clap(long, help = "Rider only: vehicle class (economy, comfort, premium, xl).")]
    pub vehicle_type: Option<VehicleType>,

    /// Component tuning. Only read from the config file.
    #[clap(skip)]
    #[serde(default)]
    pub dispatch: Option<DispatchConfig>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            role: other.role.or(self.role),
            user_id: other.user_id.or(self.user_id),
            ws_url: other.ws_url.or(self.ws_url),
            api_base_url: other.api_base_url.or(self.api_base_url),
            auth_token: other.auth_token.or(self.auth_token),
            outbox_path: other.outbox_path.or(self.outbox_path),
            position: other.position.or(self.position),
            pickup: other.pickup.or(self.pickup),
            destination: other.destination.or(self.destination),
            fare_estimate: other.fare_estimate.or(self.fare_estimate),
            vehicle_type: other.vehicle_type.or(self.vehicle_type),
            dispatch: other.dispatch.or(self.dispatch),
        }
    }

    pub fn identity(&self) -> anyhow::Result<Identity> {
        let role = self
            .role
            .ok_or_else(|| anyhow::anyhow!("no role configured (--role rider|driver)"))?;
        let user_id = self
            .user_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("no user id configured (--user-id)"))?;
        Ok(Identity::new(role, user_id))
    }

    /// Component configuration with the URLs given on the command line applied.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let mut dispatch = self.dispatch.clone().unwrap_or_default();
        if let Some(url) = &self.ws_url {
            dispatch.ws_url = url.clone();
        }
        if let Some(url) = &self.api_base_url {
            dispatch.api_base_url = url.clone();
        }
        dispatch
    }

    /// The ride to request on startup, if both ends were given.
    pub fn ride_request(&self, identity: &Identity) -> Option<NewRide> {
        let (pickup, destination) = (self.pickup?, self.destination?);
        Some(NewRide {
            rider_id: identity.user_id.clone(),
            pickup: Place::new(pickup, None),
            destination: Place::new(destination, None),
            fare_estimate: self.fare_estimate.unwrap_or_default(),
            vehicle_type: self.vehicle_type.unwrap_or(VehicleType::Economy),
        })
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        outbox_path: Some(PathBuf::from("./outbox.json")),
        ..Default::default()
    }
}

fn read_config_file(path: &PathBuf) -> Option<Config> {
    if !path.exists() {
        tracing::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                tracing::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, then the JSON config file, then environment variables and
/// command-line arguments.
pub fn load_config() -> Config {
    layered(Config::parse())
}

fn layered(cli_args: Config) -> Config {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("dispatch_client.conf"));

    let mut current_config = defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli_args)
}
