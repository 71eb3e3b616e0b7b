use std::{error::Error, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::at::{self, AtChannel, ModemError, SharedAtChannel};
use crate::{
    bus::EventBus,
    state::{ModemStatus, ModemUpdate, SignalQuality, StateWriter},
    MODEM_UPDATE,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Refreshes modem identity, registration and signal every [`POLL_INTERVAL`]
pub async fn modem_poller(
    cancel_token: CancellationToken,
    bus: EventBus,
    channel: SharedAtChannel,
    modem: StateWriter<ModemStatus>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down modem poller");
                break Ok(());
            },
            _ = tick.tick() => refresh(&bus, &channel, &modem).await,
        }
    }
}

/// One poll: query the modem, merge into state, publish the snapshot
pub async fn refresh(bus: &EventBus, channel: &SharedAtChannel, modem: &StateWriter<ModemStatus>) {
    let update = {
        let mut channel = channel.lock().await;
        match query(&mut **channel).await {
            Ok(update) => update,
            Err(err) => {
                warn!("Modem poll failed: {}", err);
                ModemUpdate {
                    connected: Some(false),
                    error: Some(Some(match err {
                        ModemError::NotFound(_) => "Modem not detected".to_string(),
                        other => other.to_string(),
                    })),
                    ..Default::default()
                }
            }
        }
    };
    let snapshot = modem.apply(update);
    bus.publish_serialized(MODEM_UPDATE, &snapshot);
}

async fn query(channel: &mut dyn AtChannel) -> Result<ModemUpdate, ModemError> {
    channel.command("AT", at::DEFAULT_TIMEOUT).await?;

    let (brand, model) = parse_identity(&ask(channel, "ATI").await);
    let iccid = parse_iccid(&ask(channel, "AT+ICCID").await);
    let imsi = digits(&ask(channel, "AT+CIMI").await);
    let imei = digits(&ask(channel, "AT+GSN").await);
    let operator = parse_operator(&ask(channel, "AT+COPS?").await);
    let registration = parse_registration(&ask(channel, "AT+CREG?").await);
    let cell = parse_cpsi(&ask(channel, "AT+CPSI?").await);

    let signal = if brand.as_deref() == Some("Quectel") {
        parse_qcsq(&ask(channel, "AT+QCSQ").await)
    } else {
        SignalQuality {
            rssi: parse_csq(&ask(channel, "AT+CSQ").await),
            ..cell.signal
        }
    };

    Ok(ModemUpdate {
        brand,
        model,
        imei,
        iccid,
        imsi,
        operator,
        registration,
        network_mode: cell.mode,
        band: cell.band,
        signal: Some(signal),
        at_port: channel.port(),
        connected: Some(true),
        error: Some(None),
    })
}

/// A query the modem may not support; failures read as no answer
async fn ask(channel: &mut dyn AtChannel, command: &str) -> Vec<String> {
    match channel.command(command, at::DEFAULT_TIMEOUT).await {
        Ok(lines) => lines,
        Err(err) => {
            trace!("{} unanswered: {}", command, err);
            Vec::new()
        }
    }
}

fn field<'a>(lines: &'a [String], prefix: &str) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|line| line.trim().strip_prefix(prefix))
        .map(str::trim)
}

fn parse_identity(lines: &[String]) -> (Option<String>, Option<String>) {
    let mut brand = None;
    let mut model = None;
    for line in lines {
        if line.to_uppercase().contains("SIMCOM") {
            brand = Some("SIMCom");
        }
        if line.contains("Quectel") {
            brand = Some("Quectel");
        }
        for known in ["SIM7600", "EC25", "EG25"] {
            if line.contains(known) {
                model = Some(known);
            }
        }
    }
    (brand.map(String::from), model.map(String::from))
}

fn parse_iccid(lines: &[String]) -> Option<String> {
    field(lines, "+ICCID:").map(String::from)
}

/// IMSI and IMEI come back as a bare digit line
fn digits(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
        .map(String::from)
}

fn parse_operator(lines: &[String]) -> Option<String> {
    // +COPS: 0,0,"giffgaff giffgaff",7
    let rest = field(lines, "+COPS:")?;
    let name = rest.split('"').nth(1)?;
    let mut words = name.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some(a), Some(b), None) if a == b => Some(a.to_string()),
        _ => Some(name.to_string()),
    }
}

fn parse_registration(lines: &[String]) -> Option<String> {
    let rest = field(lines, "+CREG:")?;
    let stat = rest.split(',').nth(1)?.trim();
    Some(
        match stat {
            "0" => "not registered",
            "1" => "home",
            "2" => "searching",
            "3" => "denied",
            "5" => "roaming",
            _ => "unknown",
        }
        .to_string(),
    )
}

fn parse_csq(lines: &[String]) -> Option<i32> {
    let rest = field(lines, "+CSQ:")?;
    let csq: i32 = rest.split(',').next()?.trim().parse().ok()?;
    // 99 = not known
    (csq != 99).then_some(-113 + csq * 2)
}

fn parse_qcsq(lines: &[String]) -> SignalQuality {
    // +QCSQ: "LTE",-52,-81,195,-10
    let Some(rest) = field(lines, "+QCSQ:") else {
        return SignalQuality::default();
    };
    let values: Vec<Option<i32>> = rest.split(',').map(|v| v.trim().parse().ok()).collect();
    let value = |i: usize| values.get(i).copied().flatten();
    SignalQuality {
        rssi: value(1),
        rsrp: value(2),
        rsrq: value(3),
        sinr: value(4),
    }
}

#[derive(Debug, Default, PartialEq)]
struct CellInfo {
    mode: Option<String>,
    band: Option<String>,
    signal: SignalQuality,
}

fn parse_cpsi(lines: &[String]) -> CellInfo {
    // +CPSI: LTE,Online,234-30,0x67F2,2871821,432,EUTRAN-BAND20,6225,2,-200,-1400,-709,12
    let Some(rest) = field(lines, "+CPSI:") else {
        return CellInfo::default();
    };
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    let number = |i: usize| parts.get(i).and_then(|v| v.parse::<i32>().ok());

    let mode = parts.first().filter(|m| !m.is_empty()).map(|m| {
        if m.contains("LTE") {
            "4G".to_string()
        } else if m.contains("NR") || m.contains("5G") {
            "5G".to_string()
        } else if m.contains("WCDMA") {
            "3G".to_string()
        } else if m.contains("GSM") {
            "2G".to_string()
        } else {
            m.to_string()
        }
    });

    // LTE reports rsrq/rsrp in tenths of a dB
    let signal = if parts.len() >= 13 {
        SignalQuality {
            rssi: None,
            rsrq: number(9).map(|v| v.div_euclid(10)),
            rsrp: number(10).map(|v| v.div_euclid(10)),
            sinr: number(12),
        }
    } else {
        SignalQuality::default()
    };

    CellInfo {
        mode,
        band: parts.get(6).map(|b| b.to_string()),
        signal,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{modem::at::fake::FakeModem, state::state_cell};

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn parses_simcom_cell_info() {
        let cell = parse_cpsi(&lines(&[
            "+CPSI: LTE,Online,234-30,0x67F2,2871821,432,EUTRAN-BAND20,6225,2,-200,-1400,-709,12",
        ]));
        assert_eq!(cell.mode.as_deref(), Some("4G"));
        assert_eq!(cell.band.as_deref(), Some("EUTRAN-BAND20"));
        assert_eq!(cell.signal.rsrq, Some(-20));
        assert_eq!(cell.signal.rsrp, Some(-140));
        assert_eq!(cell.signal.sinr, Some(12));

        let gsm = parse_cpsi(&lines(&["+CPSI: GSM,Online,234-10,0x1234,5678,12"]));
        assert_eq!(gsm.mode.as_deref(), Some("2G"));
        assert_eq!(gsm.signal, SignalQuality::default());
    }

    #[test]
    fn parses_registration_and_operator() {
        assert_eq!(
            parse_registration(&lines(&["+CREG: 0,5"])).as_deref(),
            Some("roaming")
        );
        assert_eq!(
            parse_registration(&lines(&["+CREG: 0,4"])).as_deref(),
            Some("unknown")
        );
        assert_eq!(
            parse_operator(&lines(&["+COPS: 0,0,\"LycaMobile LycaMobile\",7"])).as_deref(),
            Some("LycaMobile")
        );
        assert_eq!(
            parse_operator(&lines(&["+COPS: 0,0,\"EE Limited\",7"])).as_deref(),
            Some("EE Limited")
        );
        assert_eq!(parse_operator(&lines(&["+COPS: 0"])), None);
    }

    #[test]
    fn csq_maps_to_dbm() {
        assert_eq!(parse_csq(&lines(&["+CSQ: 21,99"])), Some(-71));
        assert_eq!(parse_csq(&lines(&["+CSQ: 99,99"])), None);
        assert_eq!(
            parse_qcsq(&lines(&["+QCSQ: \"LTE\",-52,-81,195,-10"])),
            SignalQuality {
                rssi: Some(-52),
                rsrp: Some(-81),
                rsrq: Some(195),
                sinr: Some(-10),
            }
        );
    }

    #[test]
    fn identity_and_digits() {
        let (brand, model) = parse_identity(&lines(&[
            "Manufacturer: SIMCOM INCORPORATED",
            "Model: SIMCOM_SIM7600E-H",
        ]));
        assert_eq!(brand.as_deref(), Some("SIMCom"));
        assert_eq!(model.as_deref(), Some("SIM7600"));
        assert_eq!(
            digits(&lines(&["", "234304512345678"])).as_deref(),
            Some("234304512345678")
        );
        assert_eq!(digits(&lines(&["+CME ERROR: 10"])), None);
    }

    #[tokio::test]
    async fn refresh_writes_and_publishes() {
        let modem = FakeModem::default();
        modem.reply("ATI", &["Manufacturer: SIMCOM INCORPORATED", "Model: SIMCOM_SIM7600E-H"]);
        modem.reply("AT+CSQ", &["+CSQ: 21,99"]);
        modem.reply("AT+COPS?", &["+COPS: 0,0,\"giffgaff\",7"]);
        modem.reply("AT+CREG?", &["+CREG: 0,1"]);
        modem.reply("AT+GSN", &["861234567890123"]);
        modem.reject("AT+ICCID");

        let bus = EventBus::new();
        let mut events = bus.subscribe_channel(MODEM_UPDATE);
        let (writer, reader) = state_cell(ModemStatus::default());

        refresh(&bus, &at::shared(modem), &writer).await;

        let status = reader.snapshot();
        assert!(status.connected);
        assert_eq!(status.brand.as_deref(), Some("SIMCom"));
        assert_eq!(status.operator.as_deref(), Some("giffgaff"));
        assert_eq!(status.registration.as_deref(), Some("home"));
        assert_eq!(status.imei.as_deref(), Some("861234567890123"));
        assert_eq!(status.iccid, None);
        assert_eq!(status.signal.rssi, Some(-71));
        assert_eq!(status.at_port.as_deref(), Some("/dev/ttyUSB2"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.payload["operator"], json!("giffgaff"));
        assert_eq!(event.payload["connected"], json!(true));
    }

    #[tokio::test]
    async fn missing_modem_keeps_identity() {
        let bus = EventBus::new();
        let (writer, reader) = state_cell(ModemStatus {
            brand: Some("Quectel".into()),
            connected: true,
            ..Default::default()
        });
        let dead = FakeModem {
            dead: true,
            ..Default::default()
        };

        refresh(&bus, &at::shared(dead), &writer).await;

        let status = reader.snapshot();
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("Modem not detected"));
        assert_eq!(status.brand.as_deref(), Some("Quectel"));
    }
}
