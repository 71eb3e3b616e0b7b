use std::{error::Error, time::Duration};

use futures_util::SinkExt;
use gpsd_proto::{Mode, Sky, Tpv, UnifiedResponse};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{
    bus::EventBus,
    state::{GpsStatus, GpsUpdate, StateWriter},
    GPS_UPDATE,
};

pub const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Follows gpsd and keeps the GPS state current, reconnecting when gpsd goes away
pub async fn gps_manager(
    cancel_token: CancellationToken,
    bus: EventBus,
    gpsd_addr: String,
    gps: StateWriter<GpsStatus>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        match watch_gpsd(&cancel_token, &bus, &gpsd_addr, &gps).await {
            Ok(()) => break Ok(()),
            Err(err) => warn!("GPS connection to {} lost: {}", gpsd_addr, err),
        }

        if gps.snapshot().fix {
            let snapshot = gps.apply(GpsUpdate {
                fix: Some(false),
                ..Default::default()
            });
            bus.publish_serialized(GPS_UPDATE, &snapshot);
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {},
        }
    }
}

/// One gpsd session, returns Ok only when cancelled
async fn watch_gpsd(
    cancel_token: &CancellationToken,
    bus: &EventBus,
    addr: &str,
    gps: &StateWriter<GpsStatus>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, LinesCodec::new());
    framed.send(gpsd_proto::ENABLE_WATCH_CMD).await?;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Quitting GPS handler");
                return Ok(());
            },
            res = framed.next() => match res {
                Some(Ok(msg)) => {
                    if let Some(update) = decode(&msg).and_then(to_update) {
                        let snapshot = gps.apply(update);
                        bus.publish_serialized(GPS_UPDATE, &snapshot);
                    }
                },
                Some(Err(err)) => warn!("Error decoding GPS message {err}"),
                None => return Err("gpsd closed the connection".into()),
            }
        }
    }
}

fn decode(msg: &str) -> Option<UnifiedResponse> {
    trace!("Received GPS message {msg}");
    match serde_json::from_str(msg) {
        Ok(a) => Some(a),
        Err(e) => {
            warn!("Could not decode GPS message: {msg} -- {e}");
            None
        }
    }
}

fn to_update(data: UnifiedResponse) -> Option<GpsUpdate> {
    match data {
        UnifiedResponse::Version(v) => {
            info!(
                "Connected to GPSD {}.{}.{}",
                v.proto_major, v.proto_minor, v.release
            );
            None
        }
        UnifiedResponse::Tpv(tpv) => Some(parse_tpv(tpv)),
        UnifiedResponse::Sky(sky) => parse_sky(sky),
        other => {
            trace!("Ignoring GPS message: {:?}", other);
            None
        }
    }
}

fn parse_tpv(tpv: Tpv) -> GpsUpdate {
    if !matches!(tpv.mode, Mode::Fix2d | Mode::Fix3d) {
        return GpsUpdate {
            fix: Some(false),
            ..Default::default()
        };
    }

    GpsUpdate {
        fix: Some(tpv.lat.is_some() && tpv.lon.is_some()),
        latitude: tpv.lat,
        longitude: tpv.lon,
        altitude: tpv.alt_hae.map(f64::from),
        // gpsd reports m/s
        speed_kmh: tpv.speed.map(|s| f64::from(s) * 3.6),
        heading: tpv.track.map(f64::from),
        timestamp: tpv.time,
        ..Default::default()
    }
}

fn parse_sky(sky: Sky) -> Option<GpsUpdate> {
    let used = sky.satellites?.iter().filter(|s| s.used).count();
    Some(GpsUpdate {
        satellites: Some(used as u32),
        ..Default::default()
    })
}
