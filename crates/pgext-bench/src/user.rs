//! Demo `Users` entity, its schema and the DDL that resets its table.

use chrono::{DateTime, Utc};
use pgext_postgres::natural_sort::computed_column_sql;
use pgext_postgres::{
    EntitySchema, EnumRepr, ExtractedValue, Migration, MigrationBuilder, PgEnum, PgType,
    RandomIdSequenceSpec,
};
use rust_decimal::Decimal;
use uuid::Uuid;

pub const USERS_TABLE: &str = "Users";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Inactive,
}

impl PgEnum for Status {
    fn label(&self) -> &'static str {
        match self {
            Status::Active => "Active",
            Status::Inactive => "Inactive",
        }
    }

    fn repr(&self) -> EnumRepr {
        EnumRepr::I32(*self as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

impl PgEnum for Role {
    fn label(&self) -> &'static str {
        match self {
            Role::Reader => "Reader",
            Role::Writer => "Writer",
            Role::Admin => "Admin",
        }
    }

    fn repr(&self) -> EnumRepr {
        EnumRepr::I32(*self as i32)
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Option<i64>,
    pub alternate_id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub height: Decimal,
    pub weight: Option<Decimal>,
    pub birth_date: DateTime<Utc>,
    pub death_date: Option<DateTime<Utc>>,
    pub status: Status,
    pub roles: Vec<Role>,
    pub is_married: bool,
    pub is_happy: Option<bool>,
    pub description: String,
    pub image: Vec<u8>,
    pub document: Option<Vec<u8>>,
}

impl User {
    /// Demo user number `n`.
    pub fn demo(n: usize) -> Self {
        let roles = match n % 3 {
            0 => vec![Role::Reader],
            1 => vec![Role::Reader, Role::Writer],
            _ => vec![Role::Admin],
        };
        Self {
            id: None,
            alternate_id: Uuid::new_v4(),
            name: format!("John Wick {}", n),
            address: None,
            height: Decimal::new(185, 2),
            weight: None,
            birth_date: Utc::now(),
            death_date: None,
            status: if n % 2 == 0 { Status::Active } else { Status::Inactive },
            roles,
            is_married: true,
            is_happy: None,
            description: "Some description to load the field with some data.".to_string(),
            image: vec![1, 2, 3, 4, 5],
            document: None,
        }
    }
}

pub fn generate(rows: usize) -> Vec<User> {
    (0..rows).map(User::demo).collect()
}

pub fn schema() -> pgext_postgres::Result<EntitySchema<User>> {
    EntitySchema::builder(USERS_TABLE)
        .primary_key("Id", PgType::Int8, |u: &User| u.id.into())
        .column("AlternateId", PgType::Uuid, |u: &User| u.alternate_id.into())
        .column("Name", PgType::Text, |u: &User| u.name.clone().into())
        .column("Address", PgType::Text, |u: &User| u.address.clone().into())
        .column("Height", PgType::Numeric, |u: &User| u.height.into())
        .column("Weight", PgType::Numeric, |u: &User| u.weight.into())
        .column("BirthDate", PgType::TimestampTz, |u: &User| u.birth_date.into())
        .column("DeathDate", PgType::TimestampTz, |u: &User| u.death_date.into())
        .enum_column("Status", PgType::Int4, |u: &User| {
            ExtractedValue::from_enum(&u.status)
        })
        .enum_list_column("Roles", PgType::array_of(PgType::Int4), |u: &User| {
            ExtractedValue::enum_list(&u.roles)
        })
        .column("IsMarried", PgType::Bool, |u: &User| u.is_married.into())
        .column("IsHappy", PgType::Bool, |u: &User| u.is_happy.into())
        .column("Description", PgType::Text, |u: &User| u.description.clone().into())
        .column("Image", PgType::Bytea, |u: &User| u.image.clone().into())
        .column("Document", PgType::Bytea, |u: &User| u.document.clone().into())
        .build()
}

/// Natural sort function, random-id generator and the `Users` table.
pub fn migration() -> pgext_postgres::Result<Migration> {
    let ids = RandomIdSequenceSpec::new(USERS_TABLE, "Id", 1_000_000, 1, 100)?;
    let create_table = format!(
        r#"CREATE TABLE "{table}" (
    "Id" BIGINT PRIMARY KEY DEFAULT {id_default},
    "AlternateId" UUID NOT NULL,
    "Name" TEXT NOT NULL,
    "NameSortKey" TEXT GENERATED ALWAYS AS ({sort_key}) STORED,
    "Address" TEXT,
    "Height" NUMERIC NOT NULL,
    "Weight" NUMERIC,
    "BirthDate" TIMESTAMPTZ NOT NULL,
    "DeathDate" TIMESTAMPTZ,
    "Status" INTEGER NOT NULL,
    "Roles" INTEGER[] NOT NULL,
    "IsMarried" BOOLEAN NOT NULL,
    "IsHappy" BOOLEAN,
    "Description" TEXT NOT NULL,
    "Image" BYTEA NOT NULL,
    "Document" BYTEA
);"#,
        table = USERS_TABLE,
        id_default = ids.default_value_sql(),
        sort_key = computed_column_sql("Name")?,
    );

    Ok(MigrationBuilder::new()
        .create_natural_sort_key_function()
        .create_random_id_sequence(&ids)
        .sql(
            create_table,
            format!(r#"DROP TABLE IF EXISTS "{}";"#, USERS_TABLE),
        )
        .build("create_demo_users"))
}
