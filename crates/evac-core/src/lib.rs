//! Core data model and row mapping for evacuation-space records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "evac-core";

/// Entity type tag used for every mapped record.
pub const ENTITY_TYPE: &str = "EvacuationSpace";

pub const ATTR_STRING: &str = "String";
pub const ATTR_NUMBER: &str = "Number";

/// Column names of the shelter dataset. Lookups are by name, never by position.
pub mod columns {
    pub const MUNICIPALITY_CODE: &str = "市町村コード";
    pub const SEQUENCE_NO: &str = "NO";
    pub const FACILITY_NAME: &str = "施設・場所名";
    pub const PREFECTURE_MUNICIPALITY: &str = "都道府県名及び市町村名";
    pub const ADDRESS: &str = "住所";
    pub const LATITUDE: &str = "緯度";
    pub const LONGITUDE: &str = "経度";
    pub const FLOOD: &str = "洪水";
    pub const LANDSLIDE: &str = "崖崩れ、土石流及び地滑り";
    pub const STORM_SURGE: &str = "高潮";
    pub const EARTHQUAKE: &str = "地震";
    pub const TSUNAMI: &str = "津波";
    pub const LARGE_FIRE: &str = "大規模な火事";
    pub const INLAND_FLOOD: &str = "内水氾濫";
    pub const VOLCANIC: &str = "火山現象";
    pub const SAME_ADDRESS_AS_SHELTER: &str = "指定避難所との住所同一";

    /// Every column `map_row` reads.
    pub const REQUIRED: [&str; 16] = [
        MUNICIPALITY_CODE,
        SEQUENCE_NO,
        FACILITY_NAME,
        PREFECTURE_MUNICIPALITY,
        ADDRESS,
        LATITUDE,
        LONGITUDE,
        FLOOD,
        LANDSLIDE,
        STORM_SURGE,
        EARTHQUAKE,
        TSUNAMI,
        LARGE_FIRE,
        INLAND_FLOOD,
        VOLCANIC,
        SAME_ADDRESS_AS_SHELTER,
    ];
}

/// One input row as read: column names paired with their raw text, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRow {
    fields: Vec<(String, String)>,
}

impl SourceRow {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    fn require(&self, column: &'static str) -> Result<&str, MissingColumn> {
        self.get(column).ok_or(MissingColumn(column))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SourceRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source row has no column `{0}`")]
pub struct MissingColumn(pub &'static str);

/// NGSI attribute: a nullable value plus its declared type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute<T> {
    pub value: Option<T>,
    #[serde(rename = "type")]
    pub attr_type: String,
}

impl Attribute<String> {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            attr_type: ATTR_STRING.to_string(),
        }
    }

    pub fn null_text() -> Self {
        Self {
            value: None,
            attr_type: ATTR_STRING.to_string(),
        }
    }
}

impl Attribute<f64> {
    pub fn number(value: Option<f64>) -> Self {
        Self {
            value,
            attr_type: ATTR_NUMBER.to_string(),
        }
    }
}

/// Attribute set of an evacuation space, serialized with camelCase names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationSpaceAttrs {
    pub identification: Attribute<String>,
    pub name: Attribute<String>,
    pub full_address: Attribute<String>,
    pub latitude: Attribute<f64>,
    pub longitude: Attribute<f64>,
    pub contact_point_phone_number: Attribute<String>,
    pub local_government_code: Attribute<String>,
    pub flood_from_rivers: Attribute<String>,
    pub steep_slope_failure_land_slide: Attribute<String>,
    pub storm_surges: Attribute<String>,
    pub earthquake: Attribute<String>,
    pub tsunami: Attribute<String>,
    pub fire_disasters: Attribute<String>,
    pub flood_from_inland_waters: Attribute<String>,
    pub volcanic_disasters: Attribute<String>,
    pub duplicated: Attribute<String>,
    pub evacuation_capacity: Attribute<String>,
}

/// Canonical entity sent to the context store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(flatten)]
    pub attrs: EvacuationSpaceAttrs,
}

impl Entity {
    /// Payload for a partial update: attributes only, without `id` and `type`.
    pub fn update_payload(&self) -> &EvacuationSpaceAttrs {
        &self.attrs
    }
}

pub fn entity_id(municipality_code: &str, sequence_no: &str) -> String {
    format!("{ENTITY_TYPE}_{municipality_code}_{sequence_no}")
}

/// Best-effort coordinate parse. Empty, non-numeric and non-finite text yields `None`.
pub fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Map one shelter row into its entity. Only a missing column can fail.
pub fn map_row(row: &SourceRow) -> Result<Entity, MissingColumn> {
    let code = row.require(columns::MUNICIPALITY_CODE)?;
    let no = row.require(columns::SEQUENCE_NO)?;
    let text = |column| row.require(column).map(Attribute::text);

    Ok(Entity {
        id: entity_id(code, no),
        entity_type: ENTITY_TYPE.to_string(),
        attrs: EvacuationSpaceAttrs {
            identification: Attribute::text(format!("{code}{no}")),
            name: text(columns::FACILITY_NAME)?,
            full_address: Attribute::text(format!(
                "{}{}",
                row.require(columns::PREFECTURE_MUNICIPALITY)?,
                row.require(columns::ADDRESS)?
            )),
            latitude: Attribute::number(parse_coordinate(row.require(columns::LATITUDE)?)),
            longitude: Attribute::number(parse_coordinate(row.require(columns::LONGITUDE)?)),
            contact_point_phone_number: Attribute::null_text(),
            local_government_code: Attribute::text(code),
            flood_from_rivers: text(columns::FLOOD)?,
            steep_slope_failure_land_slide: text(columns::LANDSLIDE)?,
            storm_surges: text(columns::STORM_SURGE)?,
            earthquake: text(columns::EARTHQUAKE)?,
            tsunami: text(columns::TSUNAMI)?,
            fire_disasters: text(columns::LARGE_FIRE)?,
            flood_from_inland_waters: text(columns::INLAND_FLOOD)?,
            volcanic_disasters: text(columns::VOLCANIC)?,
            duplicated: text(columns::SAME_ADDRESS_AS_SHELTER)?,
            evacuation_capacity: Attribute::null_text(),
        },
    })
}
