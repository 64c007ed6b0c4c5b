//! Rust type -> PostgreSQL column type mapping used by schema operations.

/// Maps a Rust field type to the PostgreSQL column type `create_table` and
/// `auto_migrate` declare for it.
///
/// Derived models call this for every field without an explicit
/// `#[orm(type = "...")]`.
pub trait PgType {
    /// Column type name (e.g. `"bigint"`, `"text[]"`).
    fn pg_type() -> String;

    /// Whether the column accepts NULL.
    fn nullable() -> bool {
        false
    }
}

macro_rules! pg_type {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl PgType for $t {
                fn pg_type() -> String {
                    $name.to_string()
                }
            }
        )*
    };
}

pg_type! {
    i16 => "smallint",
    i32 => "integer",
    i64 => "bigint",
    u32 => "bigint",
    f32 => "real",
    f64 => "double precision",
    bool => "boolean",
    String => "text",
    &str => "text",
    char => "char(1)",
    Vec<u8> => "bytea",
    serde_json::Value => "jsonb",
    std::net::IpAddr => "inet",
    uuid::Uuid => "uuid",
    chrono::NaiveDate => "date",
    chrono::NaiveTime => "time",
    chrono::NaiveDateTime => "timestamp",
}

impl PgType for rust_decimal::Decimal {
    fn pg_type() -> String {
        "numeric".to_string()
    }
}

impl<Tz: chrono::TimeZone> PgType for chrono::DateTime<Tz> {
    fn pg_type() -> String {
        "timestamptz".to_string()
    }
}

// Vec<T> is a Postgres array column (`Vec<String>` -> `text[]`).
impl<T: PgType> PgType for Vec<T> {
    fn pg_type() -> String {
        format!("{}[]", T::pg_type())
    }
}

impl<T: PgType> PgType for Option<T> {
    fn pg_type() -> String {
        T::pg_type()
    }

    fn nullable() -> bool {
        true
    }
}

impl<T: PgType> PgType for Box<T> {
    fn pg_type() -> String {
        T::pg_type()
    }

    fn nullable() -> bool {
        T::nullable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_scalars_arrays_and_options() {
        assert_eq!(<i64 as PgType>::pg_type(), "bigint");
        assert_eq!(<Vec<u8> as PgType>::pg_type(), "bytea");
        assert_eq!(<Vec<String> as PgType>::pg_type(), "text[]");
        assert_eq!(<Vec<Vec<i32>> as PgType>::pg_type(), "integer[][]");
        assert_eq!(
            <Option<chrono::DateTime<chrono::Utc>> as PgType>::pg_type(),
            "timestamptz"
        );
        assert!(<Option<String> as PgType>::nullable());
        assert!(!<String as PgType>::nullable());
    }
}
