pub mod article;
pub mod query;

pub use article::{
    ArticleId, ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType,
    UnifiedArticle,
};
pub use query::{NormalizedQuery, PicoQuestion, QueryKind, TermExpansion};
