/// 以 TEXT 列存储的枚举: 生成 as_str / Display / FromStr / serde / sqlx 编解码
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::error::AppError::validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                Ok(s.parse::<$name>()?)
            }
        }
    };
}

pub mod grn;
pub mod inventory;
pub mod invoice;
pub mod outbox;
pub mod product;

pub use grn::{
    AccountingEntry, EntrySide, Grn, GrnLine, GrnLineInput, GrnStatus, GrnTotals, GrnWithLines,
};
pub use inventory::{BatchReceipt, InventoryBatch};
pub use invoice::{
    InvoiceHeader, InvoiceStatus, LineCandidate, LineResolution, LineStatus, MatchOutcome,
    MatchType, ParseJob, ParseJobStatus, ParsedInvoice, ParsedInvoiceLine, ReconciliationFilter,
    ReconciliationRow, ResolvedAction, SourceType,
};
pub use outbox::{event_types, NewOutboxEvent, OutboxEvent};
pub use product::{normalize_text, NewProduct, Product, ProductCandidate, ProductQuery, VendorProductMapping};
