//! Pages and request decoding for the local setup surface, shared by the host
//! and the esp32 HTTP servers.

use millo_common::{DeviceStatus, IntakeError, IntakeRecord};

const STYLE: &str = r#"<style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    table{width:100%;border-collapse:collapse}td{padding:.25rem 0}td:last-child{text-align:right}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>"#;

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"utf-8\">\n  \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n  \
         <title>{title}</title>\n  {STYLE}\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn text_input(label: &str, name: &str, kind: &str, value: &str) -> String {
    format!(
        "    <label for=\"{name}\">{label}</label><input id=\"{name}\" name=\"{name}\" type=\"{kind}\" value=\"{value}\" required>\n",
        value = escape_html(value),
    )
}

fn credential_form(status: &DeviceStatus, submit: &str) -> String {
    let mut form = String::from("  <form class=\"card\" method=\"post\" action=\"/save\">\n");
    form.push_str(&text_input("WiFi network", "ssid", "text", &status.ssid));
    form.push_str(&text_input("WiFi password", "password", "password", ""));
    form.push_str(&text_input("Owner email", "email", "email", &status.email));
    form.push_str(&text_input(
        "Controller name",
        "controller_name",
        "text",
        &status.controller_name,
    ));
    form.push_str(&text_input(
        "Factory name",
        "factory_name",
        "text",
        &status.factory_name,
    ));
    form.push_str(&format!("    <button type=\"submit\">{submit}</button>\n  </form>"));
    form
}

fn provisioning_page(status: &DeviceStatus) -> String {
    let body = format!(
        "  <h1>Device Setup</h1>\n  <p class=\"muted\">{name} ({id}) has no network \
         configuration yet. The device restarts after saving.</p>\n{form}",
        name = escape_html(&status.device_name),
        id = escape_html(&status.controller_id),
        form = credential_form(status, "Save and restart"),
    );
    page("Device Setup", &body)
}

fn row(label: &str, value: &str) -> String {
    format!(
        "      <tr><td>{label}</td><td>{}</td></tr>\n",
        escape_html(value)
    )
}

fn status_page(status: &DeviceStatus) -> String {
    let sample = &status.sample;
    let climate = |value: f32, unit: &str| {
        if sample.climate_valid {
            format!("{value:.1} {unit}")
        } else {
            "sensor fault".to_string()
        }
    };
    let mode = if status.override_remaining_seconds > 0 {
        format!(
            "{} ({} s left)",
            status.mode.as_str(),
            status.override_remaining_seconds
        )
    } else {
        status.mode.as_str().to_string()
    };
    let alarm_class = if status.alarm_active { "err" } else { "ok" };
    let alarm_text = if status.alarm_active { "ALARM" } else { "ok" };

    let mut table = String::from("    <table>\n");
    table.push_str(&row("Controller", &status.controller_id));
    table.push_str(&row("WiFi network", &status.ssid));
    table.push_str(&row("WiFi", status.wifi_status));
    table.push_str(&row("Broker", status.mqtt_status));
    table.push_str(&row(
        "Registered",
        if status.registered { "yes" } else { "no" },
    ));
    table.push_str(&row("Owner", &status.email));
    table.push_str(&row("Controller name", &status.controller_name));
    table.push_str(&row("Factory", &status.factory_name));
    table.push_str(&row("Temperature", &climate(sample.temperature_c, "°C")));
    table.push_str(&row("Humidity", &climate(sample.humidity_pct, "%")));
    table.push_str(&row(
        "Water level",
        &format!("{:.0} %", sample.water_level_pct),
    ));
    table.push_str(&row("Mode", &mode));
    table.push_str("    </table>\n");

    let body = format!(
        "  <h1>{name}</h1>\n  <p class=\"{alarm_class}\">Status: {alarm_text}</p>\n  \
         <div class=\"card\">\n{table}  </div>\n  <h2>Update configuration</h2>\n{form}\n  \
         <form class=\"card\" method=\"post\" action=\"/factory_reset\" \
         onsubmit=\"return confirm('Erase all settings and restart?')\">\n    \
         <button type=\"submit\">Factory reset</button>\n  </form>",
        name = escape_html(&status.device_name),
        form = credential_form(status, "Save and restart"),
    );
    page(&status.device_name, &body)
}

/// `GET /`: the setup form while unconfigured, the status page otherwise.
pub fn index_page(status: &DeviceStatus) -> String {
    if status.provisioning {
        provisioning_page(status)
    } else {
        status_page(status)
    }
}

pub fn notice_page(message: &str) -> String {
    let body = format!(
        "  <h1>{}</h1>\n  <p class=\"muted\">Reconnect to the device once it is back online.</p>",
        escape_html(message)
    );
    page(message, &body)
}

/// Decodes an url-encoded `POST /save` body.
pub fn parse_form(body: &[u8]) -> Result<IntakeRecord, IntakeError> {
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
    IntakeRecord::from_form(
        fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use millo_common::{ActuatorState, DeviceMode, SensorSample, ThresholdSet};
    use pretty_assertions::assert_eq;

    fn status(provisioning: bool) -> DeviceStatus {
        DeviceStatus {
            controller_id: "24:6F:28:A1:B2:0C".to_string(),
            device_name: "ESP32_A1B20C".to_string(),
            ssid: "shed <2.4GHz>".to_string(),
            email: "grower@example.com".to_string(),
            controller_name: "Room \"A\"".to_string(),
            factory_name: "North".to_string(),
            registered: true,
            provisioning,
            wifi_status: "connected",
            mqtt_status: "disconnected",
            mode: DeviceMode::Override,
            override_remaining_seconds: 90,
            alarm_active: false,
            actuators: ActuatorState::default(),
            sample: SensorSample::default(),
            thresholds: ThresholdSet::default(),
        }
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_html(r#"<b class="x">Tom & Jerry's</b>"#),
            "&lt;b class=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/b&gt;"
        );
    }

    #[test]
    fn index_switches_on_provisioning_state() {
        let setup = index_page(&status(true));
        assert!(setup.contains("Device Setup"));
        assert!(!setup.contains("/factory_reset"));

        let configured = index_page(&status(false));
        assert!(configured.contains("action=\"/factory_reset\""));
        assert!(configured.contains("override (90 s left)"));
        assert!(configured.contains("shed &lt;2.4GHz&gt;"));
        assert!(configured.contains("Room &quot;A&quot;"));
        assert!(!configured.contains("<2.4GHz>"));
    }

    #[test]
    fn decodes_form_submission() {
        let body = b"ssid=my+net&password=p%40ss&email=a%40b.c&controller_name=Room+1&factory_name=North";
        let record = parse_form(body).unwrap();
        assert_eq!(record.ssid, "my net");
        assert_eq!(record.password, "p@ss");
        assert_eq!(record.email.as_deref(), Some("a@b.c"));
        assert_eq!(record.controller_name.as_deref(), Some("Room 1"));
    }

    #[test]
    fn form_requires_every_field() {
        let body = b"ssid=net&password=secret&email=a%40b.c&controller_name=Room";
        assert!(matches!(
            parse_form(body),
            Err(IntakeError::MissingField("factory_name"))
        ));
        assert!(matches!(
            parse_form(b"ssid=&password=x&email=a&controller_name=b&factory_name=c"),
            Err(IntakeError::MissingField("ssid"))
        ));
    }
}
