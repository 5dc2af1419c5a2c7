/// Path templates: the rendering contract the cache consumes when computing virtual filenames and
/// planning source renames. Templates are tera strings evaluated against a release or track
/// context, with a small set of registered formatting filters.
use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tera::{Context, Tera, Value};

use crate::cache::{Release, Track};
use crate::common::{Artist, ArtistMapping, ReleaseType};
use crate::error::Result;

pub fn releasetypefmt(rt: ReleaseType) -> &'static str {
    match rt {
        ReleaseType::Album => "Album",
        ReleaseType::Single => "Single",
        ReleaseType::Ep => "EP",
        ReleaseType::Compilation => "Compilation",
        ReleaseType::Soundtrack => "Soundtrack",
        ReleaseType::Live => "Live",
        ReleaseType::Remix => "Remix",
        ReleaseType::DjMix => "DJ-Mix",
        ReleaseType::Mixtape => "Mixtape",
        ReleaseType::Other => "Other",
        ReleaseType::Unknown => "Unknown",
    }
}

/// Format an array as `x, y & z`.
pub fn arrayfmt(xs: &[String]) -> String {
    match xs.len() {
        0 => String::new(),
        1 => xs[0].clone(),
        _ => format!("{} & {}", xs[..xs.len() - 1].join(", "), xs[xs.len() - 1]),
    }
}

pub fn artistsarrayfmt(artists: &[Artist]) -> String {
    let names: Vec<String> = artists.iter().filter(|a| !a.alias).map(|a| a.name.clone()).collect();
    if names.len() <= 3 {
        arrayfmt(&names)
    } else {
        format!("{} et al.", names[0])
    }
}

/// Format an artist mapping into its display form, preserving role ordering.
pub fn artistsfmt(a: &ArtistMapping) -> String {
    let mut r = artistsarrayfmt(&a.main);
    if !a.djmixer.is_empty() {
        r = artistsarrayfmt(&a.djmixer) + " pres. " + &r;
    } else if !a.composer.is_empty() {
        r = artistsarrayfmt(&a.composer) + " performed by " + &r;
    }
    if !a.guest.is_empty() {
        r = r + " (feat. " + &artistsarrayfmt(&a.guest) + ")";
    }
    if !a.producer.is_empty() {
        r = r + " (prod. " + &artistsarrayfmt(&a.producer) + ")";
    }
    if r.is_empty() {
        return "Unknown Artists".to_string();
    }
    r
}

/// A template stored as its source text and compiled on demand by the shared environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplate {
    pub text: String,
}

impl PathTemplate {
    pub fn new(text: impl Into<String>) -> PathTemplate {
        PathTemplate { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplateConfig {
    pub release: PathTemplate,
    pub track: PathTemplate,
}

pub const DEFAULT_RELEASE_TEMPLATE: &str = "\
{{ releaseartists | artistsfmt }} - \
{% if releaseyear %}{{ releaseyear }}. {% endif %}\
{{ releasetitle }}\
{% if releasetype == 'single' %} - {{ releasetype | releasetypefmt }}{% endif %}\
{% if new %} [NEW]{% endif %}";

pub const DEFAULT_TRACK_TEMPLATE: &str = "\
{% if disctotal > 1 %}{{ discnumber | zpad(width=2) }}-{% endif %}\
{{ tracknumber | zpad(width=2) }}. \
{{ tracktitle }}\
{% if trackartists.guest %} (feat. {{ trackartists.guest | artistsarrayfmt }}){% endif %}";

impl PathTemplateConfig {
    pub fn with_defaults() -> PathTemplateConfig {
        PathTemplateConfig {
            release: PathTemplate::new(DEFAULT_RELEASE_TEMPLATE),
            track: PathTemplate::new(DEFAULT_TRACK_TEMPLATE),
        }
    }
}

fn filter_arrayfmt(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let xs: Vec<String> = serde_json::from_value(value.clone()).map_err(tera::Error::json)?;
    Ok(Value::String(arrayfmt(&xs)))
}

fn filter_artistsarrayfmt(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let artists: Vec<Artist> = serde_json::from_value(value.clone()).map_err(tera::Error::json)?;
    Ok(Value::String(artistsarrayfmt(&artists)))
}

fn filter_artistsfmt(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let mapping: ArtistMapping = serde_json::from_value(value.clone()).map_err(tera::Error::json)?;
    Ok(Value::String(artistsfmt(&mapping)))
}

fn filter_releasetypefmt(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let rt: String = serde_json::from_value(value.clone()).map_err(tera::Error::json)?;
    Ok(Value::String(releasetypefmt(ReleaseType::from_str(&rt)).to_string()))
}

fn filter_zpad(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s: String = serde_json::from_value(value.clone()).map_err(tera::Error::json)?;
    let width = args.get("width").and_then(|v| v.as_u64()).unwrap_or(2) as usize;
    Ok(Value::String(format!("{s:0>width$}")))
}

static ENVIRONMENT: Lazy<Mutex<Tera>> = Lazy::new(|| {
    let mut tera = Tera::default();
    tera.register_filter("arrayfmt", filter_arrayfmt);
    tera.register_filter("artistsarrayfmt", filter_artistsarrayfmt);
    tera.register_filter("artistsfmt", filter_artistsfmt);
    tera.register_filter("releasetypefmt", filter_releasetypefmt);
    tera.register_filter("zpad", filter_zpad);
    Mutex::new(tera)
});

static SPACING_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_spacing(s: &str) -> String {
    SPACING_REGEX.replace_all(s, " ").trim().to_string()
}

fn render(template: &PathTemplate, ctx: &Context) -> Result<String> {
    let rendered = ENVIRONMENT
        .lock()
        .expect("template environment poisoned")
        .render_str(&template.text, ctx)?;
    Ok(collapse_spacing(&rendered))
}

pub fn evaluate_release_template(template: &PathTemplate, release: &Release) -> Result<String> {
    let mut ctx = Context::new();
    ctx.insert("added_at", &release.added_at);
    ctx.insert("releasetitle", &release.releasetitle);
    ctx.insert("releasetype", release.releasetype.as_str());
    ctx.insert("releaseyear", &release.releasedate.map(|d| d.year));
    ctx.insert("new", &release.new);
    ctx.insert("disctotal", &release.disctotal);
    ctx.insert("genres", &release.genres);
    ctx.insert("labels", &release.labels);
    ctx.insert("releaseartists", &release.releaseartists);
    render(template, &ctx)
}

pub fn evaluate_track_template(template: &PathTemplate, track: &Track, release: &Release) -> Result<String> {
    let mut ctx = Context::new();
    ctx.insert("tracktitle", &track.tracktitle);
    ctx.insert("tracknumber", &track.tracknumber);
    ctx.insert("tracktotal", &track.tracktotal);
    ctx.insert("discnumber", &track.discnumber);
    ctx.insert("disctotal", &release.disctotal);
    ctx.insert("duration_seconds", &track.duration_seconds);
    ctx.insert("trackartists", &track.trackartists);
    ctx.insert("releasetitle", &release.releasetitle);
    ctx.insert("releasetype", release.releasetype.as_str());
    ctx.insert("releaseyear", &release.releasedate.map(|d| d.year));
    ctx.insert("releaseartists", &release.releaseartists);
    render(template, &ctx)
}
