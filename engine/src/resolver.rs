use tally_core::error::DomainError;
use tally_core::model::{NutrientTuple, ResolutionSource, normalize_name};

use crate::catalog::NutritionCatalog;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveQuery {
    Name(String),
    Barcode(String),
}

impl ResolveQuery {
    pub fn text(&self) -> &str {
        match self {
            ResolveQuery::Name(s) | ResolveQuery::Barcode(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub nutrients: NutrientTuple,
    pub source: ResolutionSource,
}

/// Resolve a food description or barcode to nutrients.
///
/// User overrides win unconditionally: if one matches, the catalog is
/// never consulted. Only when no override matches does the query go to
/// the external catalog, and a catalog failure degrades to not-found
/// rather than surfacing as an upstream error — the user can always
/// answer it with an override.
pub async fn resolve<S: Store, C: NutritionCatalog>(
    store: &S,
    catalog: &C,
    user_id: &str,
    query: &ResolveQuery,
) -> Result<Resolved, DomainError> {
    let key = match query {
        ResolveQuery::Name(name) => normalize_name(name),
        ResolveQuery::Barcode(code) => code.clone(),
    };

    if let Some(ov) = store.find_override(user_id, &key).await? {
        return Ok(Resolved {
            nutrients: ov.nutrients,
            source: ResolutionSource::Override,
        });
    }

    let looked_up = match query {
        ResolveQuery::Name(name) => catalog.lookup_by_name(name).await,
        ResolveQuery::Barcode(code) => catalog.lookup_by_barcode(code).await,
    };
    match looked_up {
        Ok(Some(nutrients)) => Ok(Resolved {
            nutrients,
            source: match query {
                ResolveQuery::Name(_) => ResolutionSource::Catalog,
                ResolveQuery::Barcode(_) => ResolutionSource::Barcode,
            },
        }),
        Ok(None) => Err(DomainError::NotFound {
            query: query.text().to_string(),
        }),
        Err(err) => {
            tracing::warn!(query = query.text(), error = %err, "catalog lookup failed");
            Err(DomainError::NotFound {
                query: query.text().to_string(),
            })
        }
    }
}
