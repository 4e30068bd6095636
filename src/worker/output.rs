//! Job result formatting.
//!
//! Results are written as JSON, either the full document (timing, job
//! properties and one media entry holding the tracks) or, with `--brief`,
//! just the track list. Everything is sorted so the same job always produces
//! byte-identical output apart from the timestamps.

use crate::component::{Detection, MediaKind, Track};
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;

/// Serialize a property map ordered case-insensitively (ties broken by exact value).
fn serialize_props<S: Serializer>(
    props: &BTreeMap<String, String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(sorted_props(props))
}

/// Property entries in output order.
pub fn sorted_props(props: &BTreeMap<String, String>) -> Vec<(&str, &str)> {
    let mut entries: Vec<(&str, &str)> = props
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    entries.sort_by(|a, b| {
        a.0.to_uppercase()
            .cmp(&b.0.to_uppercase())
            .then_with(|| a.0.cmp(b.0))
    });
    entries
}

fn compare_props(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> Ordering {
    sorted_props(a).cmp(&sorted_props(b))
}

/// Converts frame offsets to milliseconds. A zero rate maps everything to 0.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    ms_per_frame: f64,
}

impl FrameClock {
    pub fn new(fps: f64) -> Self {
        let ms_per_frame = if fps > 0.0 { 1000.0 / fps } else { 0.0 };
        Self { ms_per_frame }
    }

    /// Clock for a job: only video has a frame rate, taken from the `FPS` metadata entry.
    pub fn for_media(kind: MediaKind, metadata: &BTreeMap<String, String>) -> Self {
        let fps = match kind {
            MediaKind::Video => metadata
                .get("FPS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0.0),
            _ => 0.0,
        };
        Self::new(fps)
    }

    pub fn millis(&self, frame: i64) -> i64 {
        (frame as f64 * self.ms_per_frame).round() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub offset_frame: i64,
    pub offset_time: i64,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
    #[serde(serialize_with = "serialize_props")]
    pub detection_properties: BTreeMap<String, String>,
}

impl DetectionRecord {
    fn from_detection(detection: Detection, clock: FrameClock) -> Self {
        Self {
            offset_frame: detection.frame,
            offset_time: clock.millis(detection.frame),
            x: detection.x,
            y: detection.y,
            width: detection.width,
            height: detection.height,
            confidence: detection.confidence,
            detection_properties: detection.properties,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.offset_frame
            .cmp(&other.offset_frame)
            .then(self.offset_time.cmp(&other.offset_time))
            .then(self.confidence.total_cmp(&other.confidence))
            .then(self.x.cmp(&other.x))
            .then(self.y.cmp(&other.y))
            .then(self.width.cmp(&other.width))
            .then(self.height.cmp(&other.height))
            .then_with(|| compare_props(&self.detection_properties, &other.detection_properties))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRecord {
    pub start_offset_frame: i64,
    pub stop_offset_frame: i64,
    pub start_offset_time: i64,
    pub stop_offset_time: i64,
    #[serde(rename = "type")]
    pub track_type: String,
    pub confidence: f32,
    #[serde(serialize_with = "serialize_props")]
    pub track_properties: BTreeMap<String, String>,
    /// The highest-confidence detection.
    pub exemplar: Option<DetectionRecord>,
    pub detections: Vec<DetectionRecord>,
}

impl TrackRecord {
    pub fn from_track(track: Track, track_type: &str, clock: FrameClock) -> Self {
        let mut detections: Vec<DetectionRecord> = track
            .detections
            .into_iter()
            .map(|d| DetectionRecord::from_detection(d, clock))
            .collect();
        detections.sort_by(DetectionRecord::compare);
        // First of equal maxima, matching the detection order.
        let exemplar = detections
            .iter()
            .reduce(|best, d| {
                if d.confidence > best.confidence {
                    d
                } else {
                    best
                }
            })
            .cloned();

        Self {
            start_offset_frame: track.start_frame,
            stop_offset_frame: track.stop_frame,
            start_offset_time: clock.millis(track.start_frame),
            stop_offset_time: clock.millis(track.stop_frame),
            track_type: track_type.to_string(),
            confidence: track.confidence,
            track_properties: track.properties,
            exemplar,
            detections,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.start_offset_frame
            .cmp(&other.start_offset_frame)
            .then(self.stop_offset_frame.cmp(&other.stop_offset_frame))
            .then(self.start_offset_time.cmp(&other.start_offset_time))
            .then(self.stop_offset_time.cmp(&other.stop_offset_time))
            .then_with(|| self.track_type.cmp(&other.track_type))
            .then(self.confidence.total_cmp(&other.confidence))
            .then_with(|| compare_props(&self.track_properties, &other.track_properties))
    }
}

/// Convert and sort a job's tracks.
pub fn to_records(tracks: Vec<Track>, track_type: &str, clock: FrameClock) -> Vec<TrackRecord> {
    let mut records: Vec<TrackRecord> = tracks
        .into_iter()
        .map(|t| TrackRecord::from_track(t, track_type, clock))
        .collect();
    records.sort_by(TrackRecord::compare);
    records
}

/// One-line summary of a job's results, phrased for the media kind.
pub fn summary(kind: MediaKind, records: &[TrackRecord]) -> String {
    match kind {
        MediaKind::Image => format!("Found {} detections.", records.len()),
        MediaKind::Video => format!(
            "Found {} tracks containing a total of {} detections.",
            records.len(),
            records.iter().map(|r| r.detections.len()).sum::<usize>()
        ),
        MediaKind::Audio | MediaKind::Generic => format!("Found {} tracks.", records.len()),
    }
}

#[derive(Debug, Serialize)]
struct TrackGroup {
    tracks: Vec<TrackRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaOutput {
    path: String,
    mime_type: String,
    #[serde(serialize_with = "serialize_props")]
    media_metadata: BTreeMap<String, String>,
    output: BTreeMap<String, Vec<TrackGroup>>,
}

/// The full result document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    time_start: String,
    time_stop: String,
    #[serde(serialize_with = "serialize_props")]
    job_properties: BTreeMap<String, String>,
    media: Vec<MediaOutput>,
}

/// Everything about a finished job that goes into its result document.
#[derive(Debug)]
pub struct JobSummary {
    pub started: DateTime<Local>,
    pub media_path: String,
    pub mime_type: String,
    pub track_type: String,
    pub job_properties: BTreeMap<String, String>,
    pub media_metadata: BTreeMap<String, String>,
}

impl JobOutput {
    pub fn new(summary: JobSummary, tracks: Vec<TrackRecord>) -> Self {
        Self {
            time_start: timestamp(summary.started),
            time_stop: timestamp(Local::now()),
            job_properties: summary.job_properties,
            media: vec![MediaOutput {
                path: summary.media_path,
                mime_type: summary.mime_type,
                media_metadata: summary.media_metadata,
                output: BTreeMap::from([(summary.track_type, vec![TrackGroup { tracks }])]),
            }],
        }
    }
}

fn timestamp(time: DateTime<Local>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Write `value` as JSON, indented by four spaces when `pretty`.
pub fn write_json<W: Write, T: Serialize>(
    mut writer: W,
    value: &T,
    pretty: bool,
) -> crate::error::Result<()> {
    if pretty {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        value.serialize(&mut serializer)?;
    } else {
        serde_json::to_writer(&mut writer, value)?;
    }
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sorted_props_case_insensitive() {
        let map = props(&[("b", "1"), ("A", "2"), ("a", "3"), ("C", "4")]);
        let keys: Vec<&str> = sorted_props(&map).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "a", "b", "C"]);
    }

    #[test]
    fn test_frame_clock() {
        let clock = FrameClock::new(25.0);
        assert_eq!(clock.millis(0), 0);
        assert_eq!(clock.millis(10), 400);
        assert_eq!(FrameClock::new(0.0).millis(100), 0);

        let metadata = props(&[("FPS", "29.97")]);
        assert_eq!(
            FrameClock::for_media(MediaKind::Video, &metadata).millis(30),
            1001
        );
        assert_eq!(
            FrameClock::for_media(MediaKind::Image, &metadata).millis(30),
            0
        );
    }

    #[test]
    fn test_track_record_sorts_detections_and_picks_exemplar() {
        let track = Track {
            start_frame: 0,
            stop_frame: 2,
            confidence: 0.8,
            properties: props(&[("CLASS", "cat")]),
            detections: vec![
                Detection {
                    frame: 2,
                    confidence: 0.5,
                    ..Default::default()
                },
                Detection {
                    frame: 0,
                    confidence: 0.9,
                    ..Default::default()
                },
                Detection {
                    frame: 1,
                    confidence: 0.9,
                    ..Default::default()
                },
            ],
        };
        let record = TrackRecord::from_track(track, "CLASS", FrameClock::new(10.0));
        let frames: Vec<i64> = record.detections.iter().map(|d| d.offset_frame).collect();
        assert_eq!(frames, vec![0, 1, 2]);
        assert_eq!(record.exemplar.as_ref().unwrap().offset_frame, 0);
        assert_eq!(record.stop_offset_time, 200);
        assert_eq!(record.track_type, "CLASS");
    }

    #[test]
    fn test_records_sorted() {
        let tracks = vec![
            Track {
                start_frame: 5,
                confidence: 0.1,
                ..Default::default()
            },
            Track {
                start_frame: 1,
                confidence: 0.2,
                ..Default::default()
            },
        ];
        let records = to_records(tracks, "TEXT", FrameClock::new(0.0));
        assert_eq!(records[0].start_offset_frame, 1);
        assert!(records[0].exemplar.is_none());
    }

    #[test]
    fn test_summary() {
        let records = to_records(
            vec![Track {
                detections: vec![Detection::default(), Detection::default()],
                ..Default::default()
            }],
            "T",
            FrameClock::new(0.0),
        );
        assert_eq!(summary(MediaKind::Image, &records), "Found 1 detections.");
        assert_eq!(
            summary(MediaKind::Video, &records),
            "Found 1 tracks containing a total of 2 detections."
        );
        assert_eq!(summary(MediaKind::Generic, &records), "Found 1 tracks.");
    }

    #[test]
    fn test_full_output_shape() {
        let records = to_records(
            vec![Track {
                confidence: 1.0,
                properties: props(&[("TEXT", "hi")]),
                ..Default::default()
            }],
            "TEXT",
            FrameClock::new(0.0),
        );
        let output = JobOutput::new(
            JobSummary {
                started: Local::now(),
                media_path: "/tmp/in.txt".into(),
                mime_type: "text/plain".into(),
                track_type: "TEXT".into(),
                job_properties: props(&[("z", "1"), ("A", "2")]),
                media_metadata: props(&[("MIME_TYPE", "text/plain")]),
            },
            records,
        );

        let mut buf = Vec::new();
        write_json(&mut buf, &output, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.find("\"A\"").unwrap() < text.find("\"z\"").unwrap());

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["timeStart"].is_string());
        assert!(value["timeStop"].is_string());
        let media = &value["media"][0];
        assert_eq!(media["path"], "/tmp/in.txt");
        assert_eq!(media["mimeType"], "text/plain");
        let track = &media["output"]["TEXT"][0]["tracks"][0];
        assert_eq!(track["type"], "TEXT");
        assert_eq!(track["trackProperties"]["TEXT"], "hi");
        assert!(track["exemplar"].is_null());
    }

    #[test]
    fn test_pretty_uses_four_spaces() {
        let mut buf = Vec::new();
        write_json(&mut buf, &props(&[("K", "V")]), true).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\n    \"K\": \"V\"\n}\n");
    }
}
