use std::sync::Arc;

use super::Collection;
use crate::db::{fields, Building, Direction, DocumentStore, Site};
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct BuildingsManager {
    buildings: Collection<Building>,
}

impl BuildingsManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        BuildingsManager { buildings: Collection::new(store) }
    }

    pub async fn all(&self) -> Result<Vec<Building>> {
        let query = self.buildings.query().order_by(fields::NAME, Direction::Ascending);
        self.buildings.fetch(query).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Building>> {
        self.buildings.get(id).await
    }

    pub async fn create(&self, name: &str, abbreviation: &str) -> Result<Building> {
        let building = Building {
            id: String::new(),
            name: name.trim().to_string(),
            abbreviation: abbreviation.trim().to_string(),
        };
        self.buildings.create(&building).await
    }
}

#[derive(Clone)]
pub struct SitesManager {
    sites: Collection<Site>,
}

impl SitesManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SitesManager { sites: Collection::new(store) }
    }

    /// Sites sorted by name, optionally only those in one building.
    pub async fn list(&self, building_id: Option<&str>) -> Result<Vec<Site>> {
        match building_id {
            Some(building) => {
                let query = self.sites.query().where_eq(fields::BUILDING_ID, building);
                let mut sites = self.sites.fetch(query).await?;
                sites.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                Ok(sites)
            }
            None => {
                let query = self.sites.query().order_by(fields::NAME, Direction::Ascending);
                self.sites.fetch(query).await
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Site>> {
        self.sites.get(id).await
    }

    pub async fn require(&self, id: &str) -> Result<Site> {
        self.sites.require(id).await
    }

    pub async fn create(&self, site: &Site) -> Result<Site> {
        if site.name.trim().is_empty() {
            return Err(StoreError::InvalidInput("site name is required".into()));
        }
        let created = self.sites.create(site).await?;
        tracing::info!(site = %created.id, name = %created.name, "created site");
        Ok(created)
    }

    /// Replace an existing site's fields.
    pub async fn update(&self, site: &Site) -> Result<()> {
        self.sites.require(&site.id).await?;
        self.sites.save(site).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.sites.delete(id).await
    }
}
