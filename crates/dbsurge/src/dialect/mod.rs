//! SQL dialect concerns: parameter style translation and per-database
//! capability selection.

pub mod capability;
pub mod paramstyle;

pub use capability::{
    create_temp_table_sql, drop_temp_table_sql, temp_table_name, truncate_temp_table_sql,
    Capabilities, DbType, MergeFlavor,
};
pub use paramstyle::{translate, ParamStyle, Params, TranslatedQuery};
