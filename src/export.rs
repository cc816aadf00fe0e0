// src/export.rs

use crate::documents::ExtractionRecord;
use crate::error::BoxError;
use crate::geocode::Geocode;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use time::Date;
use tracing::{error, info};

const CSV_HEADER: [&str; 5] = ["Address", "Title", "Description", "Closing Date", "View Application"];
const STYLE: &str = "icon-1502-0F9D58";
const ICON: &str = "https://www.gstatic.com/mapspro/images/stock/503-wht-blank_maps.png";

/// `{prefix}_{YYYY-MM-DD}.{extension}` under `dir`.
pub fn dated_path(dir: &Path, prefix: &str, date: Date, extension: &str) -> PathBuf {
    dir.join(format!("{prefix}_{date}.{extension}"))
}

/// Minimal XML text escaping.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn mappable(records: &[ExtractionRecord]) -> impl Iterator<Item = &ExtractionRecord> {
    records.iter().filter(|r| {
        if r.address.is_empty() {
            error!(file = %r.filename, "No address, record left off the map");
            false
        } else {
            true
        }
    })
}

/// Write the My Maps CSV import file.
pub fn export_csv(dir: &Path, prefix: &str, date: Date, records: &[ExtractionRecord]) -> Result<PathBuf, BoxError> {
    let path = dated_path(dir, prefix, date, "csv");
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(CSV_HEADER)?;

    let mut rows = 0;
    for r in mappable(records) {
        writer.write_record([
            r.address.as_str(),
            r.title.as_str(),
            r.description.as_str(),
            r.closing_date.as_str(),
            r.file_link.as_str(),
        ])?;
        rows += 1;
    }
    writer.flush()?;

    info!(path = %path.display(), rows, "Map data saved");
    Ok(path)
}

fn kml_header(name: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n  <Document>\n");
    let _ = writeln!(out, "    <name>{}</name>", escape(name));
    for (variant, label_scale) in [("normal", 0), ("highlight", 1)] {
        let _ = write!(
            out,
            "    <Style id=\"{STYLE}-{variant}\">\n      <IconStyle>\n        <color>ff589d0f</color>\n        \
             <scale>1</scale>\n        <Icon>\n          <href>{ICON}</href>\n        </Icon>\n      \
             </IconStyle>\n      <LabelStyle>\n        <scale>{label_scale}</scale>\n      </LabelStyle>\n    </Style>\n"
        );
    }
    let _ = write!(out, "    <StyleMap id=\"{STYLE}\">\n");
    for variant in ["normal", "highlight"] {
        let _ = write!(
            out,
            "      <Pair>\n        <key>{variant}</key>\n        <styleUrl>#{STYLE}-{variant}</styleUrl>\n      </Pair>\n"
        );
    }
    out.push_str("    </StyleMap>\n");
    out
}

fn placemark(out: &mut String, r: &ExtractionRecord, point: Option<(f64, f64)>) {
    let description = escape(&r.description);
    let closing = escape(&r.closing_date);
    let link = escape(&r.file_link);
    let address = escape(&r.address);

    let _ = write!(
        out,
        "    <Placemark>\n      <name>{}</name>\n      <address>{address}</address>\n      \
         <description><![CDATA[{description}<br/>Close date: {closing}<br/>\
         <a href=\"{link}\">View Application</a><br>address: {address}]]></description>\n      \
         <styleUrl>#{STYLE}</styleUrl>\n      <ExtendedData>\n        <Data name=\"description\">\n          \
         <value><![CDATA[{description}\nClose date: {closing}\nView Application: {link}]]></value>\n        \
         </Data>\n        <Data name=\"address\">\n          <value>{address}</value>\n        </Data>\n      \
         </ExtendedData>\n",
        escape(&r.title)
    );
    if let Some((lat, lon)) = point {
        // KML orders coordinates longitude first
        let _ = write!(out, "      <Point>\n        <coordinates>{lon},{lat},0</coordinates>\n      </Point>\n");
    }
    out.push_str("    </Placemark>\n");
}

/// Write a KML layer, adding a `Point` for every address the geocoder resolves.
pub async fn export_kml(
    dir: &Path,
    prefix: &str,
    date: Date,
    records: &[ExtractionRecord],
    geocoder: Option<&dyn Geocode>,
) -> Result<PathBuf, BoxError> {
    let path = dated_path(dir, prefix, date, "kml");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = kml_header(&name);
    let mut placed = 0;
    for r in mappable(records) {
        let point = match geocoder {
            Some(g) => g.geocode(&r.address).await.map(|c| (c.latitude, c.longitude)),
            None => None,
        };
        placed += usize::from(point.is_some());
        placemark(&mut out, r, point);
    }
    out.push_str("  </Document>\n</kml>\n");

    tokio::fs::write(&path, out).await?;
    info!(path = %path.display(), placed, "Map saved");
    Ok(path)
}
