//! Archive, GeoJSON and fake tile builder fixtures

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use tilecraft::ArchiveLayout;

/// Small FeatureCollection with two polygons
pub const WATER_GEOJSON: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"natural": "water"},
     "geometry": {"type": "Polygon", "coordinates": [[[0,0],[0.01,0],[0.01,0.01],[0,0]]]}},
    {"type": "Feature", "properties": {"natural": "water"},
     "geometry": {"type": "Polygon", "coordinates": [[[0.002,0.002],[0.004,0.002],[0.004,0.004],[0.002,0.002]]]}}
  ]
}"#;

/// Valid collection with no features
pub const EMPTY_COLLECTION: &str = r#"{"type": "FeatureCollection", "features": []}"#;

/// Minimal Overpass XML response
pub const OSM_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="Overpass API">
  <node id="1" lat="0.001" lon="0.001"><tag k="natural" v="water"/></node>
</osm>"#;

/// Write a small MBTiles archive with tiles at zoom 0 to 2
pub async fn create_mbtiles(path: &Path, layout: ArchiveLayout) {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();

    let mut statements = vec![
        "CREATE TABLE metadata (name TEXT, value TEXT)",
        "INSERT INTO metadata VALUES ('name', 'fixture'), ('format', 'pbf'), ('minzoom', '0'), ('maxzoom', '2')",
    ];
    match layout {
        ArchiveLayout::Tiles => statements.extend([
            "CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)",
            "INSERT INTO tiles VALUES (0, 0, 0, x'1A2B3C'), (1, 0, 1, x'1A2B'), (2, 1, 2, x'1A2B3C4D')",
        ]),
        ArchiveLayout::MapImages => statements.extend([
            "CREATE TABLE map (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_id TEXT)",
            "CREATE TABLE images (tile_data BLOB, tile_id TEXT)",
            "INSERT INTO map VALUES (0, 0, 0, 'a'), (1, 0, 1, 'b'), (2, 1, 2, 'a')",
            "INSERT INTO images VALUES (x'1A2B3C', 'a'), (x'1A2B', 'b')",
            "CREATE VIEW tiles AS SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column, map.tile_row AS tile_row, images.tile_data AS tile_data FROM map JOIN images ON images.tile_id = map.tile_id",
        ]),
    }

    for statement in statements {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

/// Write GeoJSON `content` to `dir/<name>.geojson`
pub async fn write_geojson(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(format!("{name}.geojson"));
    tokio::fs::write(&path, content).await.unwrap();
    path
}

/// A shell script standing in for the tile builder
///
/// Each run appends its arguments to `calls.log`. The first `failures` runs
/// misbehave (see the constructors); later runs copy the fixture archive to
/// the `--output` path.
#[derive(Debug)]
pub struct FakeBuilder {
    pub path: PathBuf,
    log: PathBuf,
}

const FAKE_BUILDER: &str = r#"#!/bin/sh
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
echo "$*" >> "@LOG@"
count=$(cat "@COUNTER@" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "@COUNTER@"
echo "Reading features"
if [ "$count" -le @FAILURES@ ]; then
@FAILURE@
fi
echo "Sorting 2 features"
echo "  50.0%  2/1/1"
cp "@FIXTURE@" "$out"
echo "Wrote $out"
"#;

impl FakeBuilder {
    /// Builder whose first `failures` runs print `failure_message` and exit 1
    #[cfg(unix)]
    pub fn install(dir: &Path, fixture: &Path, failures: u32, failure_message: &str) -> Self {
        let branch = format!("  echo \"{failure_message}\" >&2\n  exit 1");
        Self::write(dir, fixture, failures, &branch)
    }

    /// Builder whose run number `n` prints `messages[n - 1]` and exits 1
    #[cfg(unix)]
    pub fn install_sequence(dir: &Path, fixture: &Path, messages: &[&str]) -> Self {
        let mut branch = String::from("  case \"$count\" in\n");
        for (run, message) in messages.iter().enumerate() {
            branch.push_str(&format!("    {}) echo \"{message}\" >&2 ;;\n", run + 1));
        }
        branch.push_str("  esac\n  exit 1");
        Self::write(dir, fixture, messages.len() as u32, &branch)
    }

    /// Builder whose first `stalls` runs hang until they are terminated
    #[cfg(unix)]
    pub fn install_stalling(dir: &Path, fixture: &Path, stalls: u32) -> Self {
        Self::write(dir, fixture, stalls, "  sleep 30\n  exit 0")
    }

    #[cfg(unix)]
    fn write(dir: &Path, fixture: &Path, failures: u32, failure_branch: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("fake-tippecanoe");
        let log = dir.join("calls.log");
        let script = FAKE_BUILDER
            .replace("@LOG@", &log.display().to_string())
            .replace("@COUNTER@", &dir.join("calls.count").display().to_string())
            .replace("@FAILURES@", &failures.to_string())
            .replace("@FAILURE@", failure_branch)
            .replace("@FIXTURE@", &fixture.display().to_string());
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { path, log }
    }

    /// Argument lines of every run so far
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Value of a `--name=value` flag in one recorded argument line
pub fn flag_value(call: &str, name: &str) -> Option<f64> {
    let prefix = format!("--{name}=");
    call.split_whitespace()
        .find_map(|arg| arg.strip_prefix(&prefix))
        .and_then(|v| v.parse().ok())
}
