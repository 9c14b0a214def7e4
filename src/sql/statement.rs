use super::{
    errors::RenderError,
    to_sql::{render_query, RenderOptions, RenderScope},
    SharedQuery,
};

/// Top-level statement over an accumulated query.
#[derive(Debug, Clone)]
pub struct SqlSelectStatement {
    pub query: SharedQuery,
}

impl SqlSelectStatement {
    pub fn new(query: SharedQuery) -> Self {
        Self { query }
    }

    pub fn render(&self, options: &RenderOptions) -> Result<String, RenderError> {
        let query = self.query.borrow();
        let mut scope = RenderScope::new(options);
        render_query(&query, &mut scope, true)
    }

    /// Output names of the statement's columns, in order.
    pub fn column_names(&self, options: &RenderOptions) -> Vec<String> {
        super::to_sql::column_names(&self.query.borrow().select, &options.column_alias_prefix)
    }
}
