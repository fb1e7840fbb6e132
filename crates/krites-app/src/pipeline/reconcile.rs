//! Reconciliation: merge raw extraction items into canonical model records.
//!
//! Records are only rewritten when the incoming data actually differs, and a
//! real change knocks a verified record back to unverified so a human looks
//! at it again. Appearance links are maintained unconditionally.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::db::records::{canonical_tag, AppTag, ModelRecord, VerifyStatus};
use crate::db::{current_timestamp_ms, DbError, ReviewDb};
use crate::pipeline::item::RawModelItem;

/// Normalize an extracted field: trimmed, with blank collapsing to absent.
fn norm_field(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn value_unit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^±?([\d.]+)\s*([a-zA-Zμ%]+)").unwrap())
}

fn split_value_unit(value: &str) -> (String, String) {
    match value_unit_regex().captures(value.trim()) {
        Some(caps) => (caps[1].to_string(), caps[2].to_string()),
        None => (value.trim().to_string(), String::new()),
    }
}

/// Join a voltage range as `{lower}~{upper} {unit}` when both ends carry the
/// same unit, falling back to the raw `lower~upper` join.
fn join_with_unit_range(lower: Option<String>, upper: Option<String>) -> Option<String> {
    let lower = lower?;
    let upper = upper?;
    let (l_val, l_unit) = split_value_unit(&lower);
    let (u_val, u_unit) = split_value_unit(&upper);
    if !l_unit.is_empty() && l_unit == u_unit {
        Some(format!("{l_val}~{u_val} {l_unit}"))
    } else {
        Some(format!("{lower}~{upper}"))
    }
}

/// The seven specification fields in their stored form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectedFields {
    pub input_voltage_range: Option<String>,
    pub output_voltage: Option<String>,
    pub output_power: Option<String>,
    pub package: Option<String>,
    pub isolation: Option<String>,
    pub insulation: Option<String>,
    pub dimension: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectedModel {
    pub model_number: String,
    pub fields: ProjectedFields,
    pub applications: Vec<String>,
}

/// Flatten one raw extraction item into storable fields. Returns `None` when
/// the item carries no model number.
pub fn project_item(item: &RawModelItem) -> Option<ProjectedModel> {
    let model_number = norm_field(item.model_number.as_deref())?;

    let input_voltage_range = item.input_voltage.as_ref().and_then(|iv| {
        join_with_unit_range(
            norm_field(iv.lower.as_deref()),
            norm_field(iv.upper.as_deref()),
        )
    });

    let output_voltage = item.output_voltage.as_ref().and_then(|ov| {
        let value = norm_field(ov.value.as_deref())?;
        if ov.dual_output.unwrap_or(false) {
            Some(format!("±{value}"))
        } else {
            Some(value)
        }
    });

    let dimension = item.dimension.as_ref().and_then(|dim| {
        let length = norm_field(dim.length.as_deref())?;
        let width = norm_field(dim.width.as_deref())?;
        let height = norm_field(dim.height.as_deref())?;
        Some(format!("{length} x {width} x {height}"))
    });

    let applications = item
        .application
        .as_ref()
        .and_then(|app| app.values.clone())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tag| norm_field(Some(&tag)))
        .collect();

    Some(ProjectedModel {
        model_number,
        fields: ProjectedFields {
            input_voltage_range,
            output_voltage,
            output_power: item
                .output_power
                .as_ref()
                .and_then(|f| norm_field(f.value.as_deref())),
            package: item
                .package
                .as_ref()
                .and_then(|f| norm_field(f.value.as_deref())),
            isolation: item
                .isolation
                .as_ref()
                .and_then(|f| norm_field(f.value.as_deref())),
            insulation: item
                .insulation
                .as_ref()
                .and_then(|f| norm_field(f.value.as_deref())),
            dimension,
        },
        applications,
    })
}

fn fields_changed(record: &ModelRecord, fields: &ProjectedFields) -> bool {
    let pairs = [
        (&record.input_voltage_range, &fields.input_voltage_range),
        (&record.output_voltage, &fields.output_voltage),
        (&record.output_power, &fields.output_power),
        (&record.package, &fields.package),
        (&record.isolation, &fields.isolation),
        (&record.insulation, &fields.insulation),
        (&record.dimension, &fields.dimension),
    ];
    pairs.iter().any(|(old, new)| {
        norm_field(old.as_deref()) != norm_field(new.as_deref())
    })
}

fn apps_changed(record: &ModelRecord, apps: &[String]) -> bool {
    let old: HashSet<&str> = record.applications.iter().map(|t| t.canon.as_str()).collect();
    let new: HashSet<String> = apps.iter().map(|a| canonical_tag(a)).collect();
    old.len() != new.len() || !new.iter().all(|c| old.contains(c.as_str()))
}

/// Replace the tag set wholesale while keeping the originally stored casing
/// for tags that survive.
fn merge_tags(existing: &[AppTag], apps: &[String]) -> Vec<AppTag> {
    let new_canon: HashSet<String> = apps.iter().map(|a| canonical_tag(a)).collect();
    let mut merged: Vec<AppTag> = existing
        .iter()
        .filter(|tag| new_canon.contains(&tag.canon))
        .cloned()
        .collect();
    let mut seen: HashSet<String> = merged.iter().map(|t| t.canon.clone()).collect();
    for app in apps {
        let tag = AppTag::new(app.clone());
        if seen.insert(tag.canon.clone()) {
            merged.push(tag);
        }
    }
    merged
}

/// Merge one extraction item into the database. Returns the model number
/// when the item was usable.
pub fn reconcile_item(
    db: &ReviewDb,
    file_hash: &str,
    item: &RawModelItem,
) -> Result<Option<String>, DbError> {
    let Some(projected) = project_item(item) else {
        return Ok(None);
    };
    let model_number = projected.model_number.clone();

    let existing = db.get_model(&model_number)?;
    let is_new = existing.is_none();
    let mut record = existing.unwrap_or_else(|| ModelRecord::new(&model_number));

    let diff_fields = fields_changed(&record, &projected.fields);
    let diff_apps = apps_changed(&record, &projected.applications);
    let changed = is_new || diff_fields || diff_apps;

    if changed {
        record.input_voltage_range = projected.fields.input_voltage_range;
        record.output_voltage = projected.fields.output_voltage;
        record.output_power = projected.fields.output_power;
        record.package = projected.fields.package;
        record.isolation = projected.fields.isolation;
        record.insulation = projected.fields.insulation;
        record.dimension = projected.fields.dimension;
        record.applications = merge_tags(&record.applications, &projected.applications);

        if record.verify_status == VerifyStatus::Verified {
            record.verify_status = VerifyStatus::Unverified;
            record.reviewer = None;
            record.reviewed_at_ms = None;
        }
        record.updated_at_ms = current_timestamp_ms();
        db.put_model(&record)?;
        debug!(
            model_number = %model_number,
            new = is_new,
            stage = "reconcile",
            "model record updated"
        );
    }

    db.ensure_appearance(file_hash, &model_number)?;
    Ok(Some(model_number))
}
