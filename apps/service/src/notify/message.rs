use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::database::models::{Incident, Monitor, TriggerEvent};

fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.as_secs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours} hours {minutes} minutes")
    } else {
        format!("{minutes} minutes")
    }
}

fn downtime_text(incident: &Incident) -> String {
    incident.downtime().map(format_duration).unwrap_or_else(|| "unknown".into())
}

fn region_text(incident: &Incident) -> &str {
    incident.region.as_deref().unwrap_or("global")
}

pub fn email_subject(monitor: &Monitor, event: TriggerEvent) -> String {
    let name = monitor.display_name();
    match event {
        TriggerEvent::Down => format!("🔴 Monitor Alert: {name} is DOWN"),
        TriggerEvent::Recovery => format!("✅ Monitor Recovery: {name} is UP"),
    }
}

pub fn email_html(monitor: &Monitor, incident: &Incident, event: TriggerEvent) -> String {
    let name = monitor.display_name();
    let kind = monitor.monitor_type.as_str().to_uppercase();
    let region = region_text(incident);

    match event {
        TriggerEvent::Down => {
            let error_item = incident
                .last_error
                .as_deref()
                .map(|e| format!("<li><strong>Error:</strong> {e}</li>"))
                .unwrap_or_default();
            format!(
                "<h2>Monitor Alert: {name} is DOWN</h2>\
                 <p>Your monitor has stopped responding.</p>\
                 <ul>\
                 <li><strong>Monitor:</strong> {name}</li>\
                 <li><strong>Type:</strong> {kind}</li>\
                 <li><strong>Region:</strong> {region}</li>\
                 <li><strong>Time:</strong> {}</li>\
                 {error_item}\
                 </ul>\
                 <p>We'll continue monitoring and notify you when the service recovers.</p>",
                format_time(incident.started_at)
            )
        }
        TriggerEvent::Recovery => format!(
            "<h2>Monitor Recovery: {name} is UP</h2>\
             <p>Your monitor has recovered and is responding normally.</p>\
             <ul>\
             <li><strong>Monitor:</strong> {name}</li>\
             <li><strong>Type:</strong> {kind}</li>\
             <li><strong>Region:</strong> {region}</li>\
             <li><strong>Downtime Duration:</strong> {}</li>\
             <li><strong>Recovery Time:</strong> {}</li>\
             </ul>",
            downtime_text(incident),
            format_time(SystemTime::now())
        ),
    }
}

/// Discord webhook payload: a single embed, red for down, green for up.
pub fn discord_payload(monitor: &Monitor, incident: &Incident, event: TriggerEvent) -> Value {
    let name = monitor.display_name();
    let mut fields = vec![
        json!({ "name": "Monitor", "value": name, "inline": true }),
        json!({ "name": "Type", "value": monitor.monitor_type.as_str().to_uppercase(), "inline": true }),
        json!({ "name": "Region", "value": region_text(incident), "inline": true }),
    ];

    match event {
        TriggerEvent::Down => {
            fields.push(json!({
                "name": "Time",
                "value": format_time(incident.started_at),
                "inline": false
            }));
            if let Some(error) = &incident.last_error {
                fields.push(json!({ "name": "Error", "value": error, "inline": false }));
            }
        }
        TriggerEvent::Recovery => {
            fields.push(json!({
                "name": "Downtime Duration",
                "value": downtime_text(incident),
                "inline": true
            }));
            fields.push(json!({
                "name": "Recovery Time",
                "value": format_time(SystemTime::now()),
                "inline": true
            }));
        }
    }

    json!({
        "embeds": [{
            "title": email_subject(monitor, event),
            "color": match event {
                TriggerEvent::Down => 0x00ff_0000,
                TriggerEvent::Recovery => 0x0000_ff00,
            },
            "fields": fields,
            "timestamp": DateTime::<Utc>::from(SystemTime::now()).to_rfc3339(),
        }]
    })
}

/// Slack webhook payload: header + field section blocks, with a plain
/// `text` fallback for clients that ignore blocks.
pub fn slack_payload(
    monitor: &Monitor,
    incident: &Incident,
    event: TriggerEvent,
    channel: Option<&str>,
) -> Value {
    let name = monitor.display_name();
    let emoji = match event {
        TriggerEvent::Down => ":red_circle:",
        TriggerEvent::Recovery => ":white_check_mark:",
    };
    let headline = match event {
        TriggerEvent::Down => format!("{emoji} Monitor Alert: {name} is DOWN"),
        TriggerEvent::Recovery => format!("{emoji} Monitor Recovery: {name} is UP"),
    };

    let mut fields = vec![
        json!({ "type": "mrkdwn", "text": format!("*Monitor:*\n{name}") }),
        json!({
            "type": "mrkdwn",
            "text": format!("*Type:*\n{}", monitor.monitor_type.as_str().to_uppercase())
        }),
        json!({ "type": "mrkdwn", "text": format!("*Region:*\n{}", region_text(incident)) }),
    ];

    match event {
        TriggerEvent::Down => fields.push(json!({
            "type": "mrkdwn",
            "text": format!("*Time:*\n{}", format_time(incident.started_at))
        })),
        TriggerEvent::Recovery => fields.push(json!({
            "type": "mrkdwn",
            "text": format!("*Duration:*\n{}", downtime_text(incident))
        })),
    }

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": headline, "emoji": true }
        }),
        json!({ "type": "section", "fields": fields }),
    ];

    if event == TriggerEvent::Down {
        if let Some(error) = &incident.last_error {
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Error:* {error}") }
            }));
        }
    }

    let mut payload = json!({
        "blocks": blocks,
        "text": match event {
            TriggerEvent::Down => format!("Monitor Alert: {name} is DOWN"),
            TriggerEvent::Recovery => format!("Monitor Recovery: {name} is UP"),
        },
    });

    if let Some(channel) = channel {
        payload["channel"] = Value::String(channel.to_string());
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::IncidentStatus;

    fn sample_incident(monitor: &Monitor) -> Incident {
        let started = SystemTime::now() - Duration::from_secs(2 * 3600 + 5 * 60);
        Incident {
            id: 1,
            monitor_uuid: monitor.uuid,
            region: Some("us-east".into()),
            status: IncidentStatus::Closed,
            started_at: started,
            ended_at: Some(SystemTime::now()),
            last_error: Some("connection refused".into()),
            last_error_kind: None,
        }
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(45)), "0 minutes");
        assert_eq!(format_duration(Duration::from_secs(5 * 60)), "5 minutes");
        assert_eq!(format_duration(Duration::from_secs(2 * 3600 + 5 * 60)), "2 hours 5 minutes");
    }

    #[test]
    fn down_email_carries_error() {
        let monitor = Monitor::new_http("org", "https://example.com");
        let incident = sample_incident(&monitor);

        let subject = email_subject(&monitor, TriggerEvent::Down);
        assert!(subject.contains("DOWN"));
        let html = email_html(&monitor, &incident, TriggerEvent::Down);
        assert!(html.contains("connection refused"));
        assert!(html.contains("us-east"));
        assert!(html.contains("HTTP"));
    }

    #[test]
    fn recovery_email_carries_downtime() {
        let monitor = Monitor::new_http("org", "https://example.com");
        let incident = sample_incident(&monitor);

        let html = email_html(&monitor, &incident, TriggerEvent::Recovery);
        assert!(html.contains("2 hours 5 minutes"));
        assert!(!html.contains("connection refused"), "recovery mail omits the error");
    }

    #[test]
    fn discord_embed_shape() {
        let monitor = Monitor::new_http("org", "https://example.com");
        let incident = sample_incident(&monitor);

        let payload = discord_payload(&monitor, &incident, TriggerEvent::Down);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], 0x00ff_0000);
        let fields = embed["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Error"));

        let recovery = discord_payload(&monitor, &incident, TriggerEvent::Recovery);
        let fields = recovery["embeds"][0]["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Downtime Duration"));
    }

    #[test]
    fn slack_channel_override() {
        let monitor = Monitor::new_tcp("org", "db.internal", 5432);
        let incident = Incident { region: None, ..sample_incident(&monitor) };

        let payload = slack_payload(&monitor, &incident, TriggerEvent::Down, Some("#alerts"));
        assert_eq!(payload["channel"], "#alerts");
        assert!(payload["text"].as_str().unwrap().contains("db.internal:5432"));

        let no_override = slack_payload(&monitor, &incident, TriggerEvent::Down, None);
        assert!(no_override.get("channel").is_none());

        // Null region renders as the global aggregate.
        let blocks = no_override["blocks"].as_array().unwrap();
        let section = blocks[1]["fields"].as_array().unwrap();
        assert!(section.iter().any(|f| f["text"].as_str().unwrap().contains("global")));
    }
}
