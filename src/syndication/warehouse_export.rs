//! Denormalised response export loaded into the analytical warehouse.

use crate::cloud::WarehouseField;

const BASE_TABLES: [&str; 6] = [
    "countries",
    "settlements",
    "service_types",
    "service_points",
    "users",
    "responses",
];

/// Tables the export query reads
pub fn export_tables(with_tags: bool) -> Vec<String> {
    let mut tables: Vec<String> = BASE_TABLES.iter().map(|t| t.to_string()).collect();
    if with_tags {
        tables.push("tags".to_string());
    }
    tables
}

/// One row per response, or per (response, tag) pair with tags
pub fn export_query(with_tags: bool) -> String {
    let tag_column = if with_tags { ",\n    t.name AS tag" } else { "" };
    let tag_join = if with_tags {
        "LEFT JOIN public.tags AS t ON t.response_id = r.id\n"
    } else {
        ""
    };

    format!(
        r#"SELECT
    c.name AS country_name,
    s.name AS location_name,
    sp.name AS service_point_name,
    st.name AS service_type,
    satisfied,
    CASE
        WHEN response_type = 'binary' OR idea IS NULL THEN 'Self-Swipe'
        ELSE 'Survey'
    END AS response_type,
    r.response_type AS response_type_raw,
    CASE
        WHEN satisfied THEN 1
        ELSE 0
    END AS satisfied_num,
    regexp_replace(idea, '[\n\r]+', ' ', 'g') AS idea,
    r.lat AS response_lat,
    r.lng AS response_lng,
    point(r.lng, r.lat) AS response_point,
    concat(r.lat, ',', r.lng) AS lat_lon,
    r.created_at AT TIME ZONE 'UTC' AS created_at_utc,
    r.uploaded_at AT TIME ZONE 'UTC' AS uploaded_at_utc,
    tz.time_zone,
    r.created_at AT TIME ZONE tz.time_zone AS created_at_tz,
    r.uploaded_at AT TIME ZONE tz.time_zone AS uploaded_at_tz,
    unique_id,
    user_id,
    is_starred{tag_column}
FROM public.responses AS r
INNER JOIN public.service_points AS sp ON r.service_point_id = sp.id
INNER JOIN public.settlements AS s ON sp.settlement_id = s.id
INNER JOIN public.service_types AS st ON sp.service_type_id = st.id
INNER JOIN public.countries AS c ON c.id = s.country_id
{tag_join}LEFT JOIN (
    VALUES ('RW', 'Africa/Kigali'), ('SD', 'Africa/Khartoum'), ('UG', 'Africa/Kampala'),
           ('SO', 'Africa/Mogadishu'), ('CO', 'America/Bogota')
) AS tz (iso_two_letter_code, time_zone) ON tz.iso_two_letter_code = c.iso_two_letter_code
INNER JOIN public.users AS u ON r.user_id = u.id
WHERE r.created_at BETWEEN '1 April 2010' AND '1 April 2030'"#
    )
}

/// Warehouse columns matching [`export_query`]
pub fn table_schema(with_tags: bool) -> Vec<WarehouseField> {
    let mut schema: Vec<WarehouseField> = [
        ("country_name", "STRING"),
        ("location_name", "STRING"),
        ("service_point_name", "STRING"),
        ("service_type", "STRING"),
        ("satisfied", "BOOLEAN"),
        ("response_type", "STRING"),
        ("response_type_raw", "STRING"),
        ("satisfied_num", "INTEGER"),
        ("idea", "STRING"),
        ("response_lat", "FLOAT"),
        ("response_lng", "FLOAT"),
        ("response_point", "STRING"),
        ("lat_lon", "STRING"),
        ("created_at_utc", "TIMESTAMP"),
        ("uploaded_at_utc", "TIMESTAMP"),
        ("time_zone", "STRING"),
        ("created_at_tz", "TIMESTAMP"),
        ("uploaded_at_tz", "TIMESTAMP"),
        ("unique_id", "STRING"),
        ("user_id", "INTEGER"),
        ("is_starred", "BOOLEAN"),
    ]
    .into_iter()
    .map(|(name, field_type)| WarehouseField::new(name, field_type))
    .collect();

    if with_tags {
        schema.push(WarehouseField::new("tags", "STRING"));
    }
    schema
}
