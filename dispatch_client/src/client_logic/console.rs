use std::str::FromStr;

use lib_dispatch::core::RideUpdate;
use lib_dispatch::{DispatchContext, LatLng, UserRole};

use super::config::parse_lat_lng;
use super::device::ManualPosition;

/// One line typed on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Cancel(Option<String>),
    Pickup,
    Pending,
    Accept(String),
    Reject(String, Option<String>),
    Start,
    Complete,
    MoveTo(LatLng),
    Dismiss,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  status                  ride and connection state
  cancel [reason]         cancel the current ride
  pickup                  rider: confirm the driver picked you up
  pending                 driver: list rides waiting for a driver
  accept <ride-id>        driver: take a pending ride
  reject <ride-id> [why]  driver: turn a pending ride down
  start                   driver: rider is on board
  complete                driver: drop-off done
  move <lat,lng>          update this device's position
  dismiss                 archive a finished ride
  quit";

fn rest(parts: &[&str]) -> Option<String> {
    (!parts.is_empty()).then(|| parts.join(" "))
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((head, args)) = words.split_first() else {
            return Err("empty command".to_string());
        };
        let ride_id = || {
            args.first()
                .map(|s| s.to_string())
                .ok_or_else(|| format!("'{}' needs a ride id", head))
        };

        match head.to_ascii_lowercase().as_str() {
            "status" | "s" => Ok(Command::Status),
            "cancel" => Ok(Command::Cancel(rest(args))),
            "pickup" => Ok(Command::Pickup),
            "pending" => Ok(Command::Pending),
            "accept" => Ok(Command::Accept(ride_id()?)),
            "reject" => Ok(Command::Reject(ride_id()?, rest(&args[1..]))),
            "start" => Ok(Command::Start),
            "complete" => Ok(Command::Complete),
            "move" => {
                let coords = rest(args).ok_or("'move' needs 'lat,lng'")?;
                Ok(Command::MoveTo(parse_lat_lng(&coords)?))
            }
            "dismiss" => Ok(Command::Dismiss),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(format!("unknown command '{}', try 'help'", other)),
        }
    }
}

/// Runs one command. Returns `false` when the client should exit.
pub async fn execute(ctx: &DispatchContext, position: &ManualPosition, command: Command) -> bool {
    if command == Command::Quit {
        return false;
    }
    let rides = ctx.rides();
    let outcome: anyhow::Result<()> = async {
        match command {
            Command::Status => print_status(ctx),
            Command::Cancel(reason) => rides.cancel_ride(reason).await?,
            Command::Pickup => rides.confirm_pickup()?,
            Command::Pending => {
                let pending = rides.pending_rides().await?;
                if pending.is_empty() {
                    println!("no pending rides");
                }
                for ride in pending {
                    println!(
                        "{}  rider {}  {:.5},{:.5} -> {:.5},{:.5}  {:?}  est. {:.2}",
                        ride.id,
                        ride.rider_id,
                        ride.pickup.location.lat,
                        ride.pickup.location.lng,
                        ride.destination.location.lat,
                        ride.destination.location.lng,
                        ride.vehicle_type,
                        ride.fare_estimate
                    );
                }
            }
            Command::Accept(ride_id) => {
                rides.accept_ride(&ride_id).await?;
            }
            Command::Reject(ride_id, reason) => rides.reject_ride(&ride_id, reason).await?,
            Command::Start => rides.start_ride().await?,
            Command::Complete => {
                rides.complete_ride().await?;
            }
            Command::MoveTo(location) => position.set(location),
            Command::Dismiss => {
                if !rides.dismiss() {
                    println!("nothing to dismiss");
                }
            }
            Command::Help | Command::Quit => println!("{}", HELP),
        }
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        println!("error: {}", e);
    }
    true
}

fn print_status(ctx: &DispatchContext) {
    let connection = ctx.connection();
    println!(
        "{} | push channel {:?}{} | ride {}",
        ctx.identity(),
        connection.status(),
        connection
            .last_latency()
            .map(|l| format!(" ({} ms)", l.as_millis()))
            .unwrap_or_default(),
        ctx.rides()
            .current_ride()
            .map(|r| format!("{} ({}{})", r.id, r.state, if r.is_local_fallback { ", queued" } else { "" }))
            .unwrap_or_else(|| "none".to_string())
    );
    if let Some(idle) = connection.idle_for() {
        println!("  last frame {} s ago", idle.as_secs());
    }
    if let Some(sample) = ctx.rides().relay().last_counterparty() {
        println!(
            "  {} last seen at {:.5},{:.5} ({})",
            sample.owner,
            sample.location.lat,
            sample.location.lng,
            sample.captured_at.format("%H:%M:%S")
        );
    }
}

/// One line per update, phrased for whoever sits at `role`'s side.
pub fn describe(update: &RideUpdate, role: UserRole) -> String {
    match update {
        RideUpdate::StateChanged { ride_id, from, to } => {
            format!("[{}] {} -> {}", ride_id, from, to)
        }
        RideUpdate::SearchProgress { ride_id, milestone, .. } => {
            format!("[{}] {}...", ride_id, milestone.message())
        }
        RideUpdate::NoDriversAvailable { ride_id } => {
            format!("[{}] no drivers available, please try again", ride_id)
        }
        RideUpdate::DriverAssigned {
            ride_id,
            driver,
            estimated_arrival,
        } => format!(
            "[{}] driver {} assigned{}",
            ride_id,
            driver.name.as_deref().unwrap_or(&driver.id),
            estimated_arrival
                .map(|m| format!(", arriving in {} min", m))
                .unwrap_or_default()
        ),
        RideUpdate::Rejected { ride_id, reason } => format!(
            "[{}] a driver declined{}",
            ride_id,
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        ),
        RideUpdate::CounterpartyLocation {
            ride_id, distance_m, ..
        } => match distance_m {
            Some(d) => format!("[{}] {} is {:.0} m away", ride_id, role.counterparty(), d),
            None => format!("[{}] {} position updated", ride_id, role.counterparty()),
        },
        RideUpdate::QueuedOffline { local_id } => {
            format!("[{}] offline: request queued, will retry", local_id)
        }
        RideUpdate::Resynced { local_id, ride_id } => {
            format!("[{}] request delivered as {}", local_id, ride_id)
        }
        RideUpdate::Completed { ride_id, fare } => format!(
            "[{}] ride completed{}",
            ride_id,
            fare.map(|f| format!(", fare {:.2}", f)).unwrap_or_default()
        ),
        RideUpdate::Cancelled {
            ride_id,
            cancelled_by,
            reason,
        } => format!(
            "[{}] ride cancelled{}{}",
            ride_id,
            cancelled_by
                .as_deref()
                .map(|by| format!(" by {}", by))
                .unwrap_or_default(),
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        ),
    }
}
