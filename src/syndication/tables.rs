//! Catalogue of the tables copied from every source environment.
//!
//! The order is the foreign-key order: a table only references tables listed
//! before it, so imports land parents before children.

/// One table moved between environments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyndicatedTable {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl SyndicatedTable {
    /// Query selecting the rows created locally in the source environment.
    /// Rows at or above `local_threshold` arrived there through syndication
    /// themselves and are never re-exported.
    pub fn export_query(&self, local_threshold: i64) -> String {
        format!(
            "SELECT {} FROM public.{} WHERE id < {local_threshold};",
            self.columns.join(", "),
            self.name
        )
    }

    /// Next table in the catalogue, `None` for the last one
    pub fn successor(&self) -> Option<&'static SyndicatedTable> {
        let position = TABLES.iter().position(|table| table.name == self.name)?;
        TABLES.get(position + 1)
    }
}

pub const TABLES: [SyndicatedTable; 6] = [
    SyndicatedTable {
        name: "countries",
        columns: &[
            "id",
            "enabled",
            "name",
            "iso_two_letter_code",
            "geojson",
            "lat",
            "lng",
            "created_at",
            "updated_at",
        ],
    },
    SyndicatedTable {
        name: "settlements",
        columns: &[
            "id",
            "name",
            "geojson",
            "lat",
            "lng",
            "created_at",
            "updated_at",
            "country_id",
        ],
    },
    SyndicatedTable {
        name: "service_types",
        columns: &["id", "name", "created_at", "updated_at"],
    },
    SyndicatedTable {
        name: "service_points",
        columns: &[
            "id",
            "service_type_id",
            "settlement_id",
            "name",
            "lat",
            "lng",
            "created_at",
            "updated_at",
        ],
    },
    SyndicatedTable {
        name: "users",
        columns: &[
            "id",
            "email",
            "encrypted_password",
            "reset_password_token",
            "reset_password_sent_at",
            "remember_created_at",
            "sign_in_count",
            "current_sign_in_at",
            "last_sign_in_at",
            "current_sign_in_ip",
            "last_sign_in_ip",
            "created_at",
            "updated_at",
            "is_admin",
            "provider",
            "uid",
            "tokens",
            "settlement_id",
            "is_survey",
            "is_service_provider",
        ],
    },
    SyndicatedTable {
        name: "responses",
        columns: &[
            "id",
            "service_point_id",
            "satisfied",
            "idea",
            "lat",
            "lng",
            "created_at",
            "updated_at",
            "phase2_id",
            "uploaded_at",
            "unique_id",
            "user_id",
            "response_type",
            "is_starred",
            "nlp_extract_adjectives_processed",
            "idea_language",
            "idea_token_vector",
        ],
    },
];

pub fn first() -> &'static SyndicatedTable {
    &TABLES[0]
}

/// Look a table up by name; unknown names are not part of the catalogue
pub fn find(name: &str) -> Option<&'static SyndicatedTable> {
    TABLES.iter().find(|table| table.name == name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    TABLES.iter().map(|table| table.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_is_walked_in_dependency_order() {
        let mut walked = vec![first().name];
        let mut table = first();
        while let Some(next) = table.successor() {
            walked.push(next.name);
            table = next;
        }
        assert_eq!(
            walked,
            vec!["countries", "settlements", "service_types", "service_points", "users", "responses"]
        );
    }

    #[test]
    fn test_export_query_selects_local_rows_only() {
        let query = find("service_types").unwrap().export_query(1_000_000_000);
        assert_eq!(
            query,
            "SELECT id, name, created_at, updated_at FROM public.service_types WHERE id < 1000000000;"
        );
    }

    #[test]
    fn test_unknown_table_is_not_found() {
        assert!(find("tag_filters").is_none());
        assert!(find("").is_none());
        assert!(find("Countries").is_none());
    }
}
