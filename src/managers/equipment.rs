use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::Collection;
use crate::db::{fields, Computer, Direction, DocumentStore, Printer, PrinterStatus};
use crate::error::Result;
use crate::patch;

#[derive(Clone)]
pub struct ComputersManager {
    computers: Collection<Computer>,
}

impl ComputersManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ComputersManager { computers: Collection::new(store) }
    }

    pub async fn list(&self, site_id: Option<&str>) -> Result<Vec<Computer>> {
        match site_id {
            Some(site) => {
                let query = self.computers.query().where_eq(fields::SITE_ID, site);
                let mut computers = self.computers.fetch(query).await?;
                computers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                Ok(computers)
            }
            None => {
                let query = self.computers.query().order_by(fields::NAME, Direction::Ascending);
                self.computers.fetch(query).await
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Computer>> {
        self.computers.get(id).await
    }

    pub async fn create(&self, computer: &Computer) -> Result<Computer> {
        self.computers.create(computer).await
    }

    pub async fn mark_cleaned(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.computers
            .patch(id, patch! { "lastCleaned" => at.timestamp_millis() })
            .await
    }

    /// Stamp every listed computer; stops at the first failure.
    pub async fn mark_all_cleaned(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        for id in ids {
            self.mark_cleaned(id, at).await?;
        }
        Ok(ids.len())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.computers.delete(id).await
    }
}

#[derive(Clone)]
pub struct PrintersManager {
    printers: Collection<Printer>,
}

impl PrintersManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        PrintersManager { printers: Collection::new(store) }
    }

    pub async fn list(&self, site_id: Option<&str>) -> Result<Vec<Printer>> {
        match site_id {
            Some(site) => {
                let query = self.printers.query().where_eq(fields::SITE_ID, site);
                let mut printers = self.printers.fetch(query).await?;
                printers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                Ok(printers)
            }
            None => {
                let query = self.printers.query().order_by(fields::NAME, Direction::Ascending);
                self.printers.fetch(query).await
            }
        }
    }

    pub async fn create(&self, printer: &Printer) -> Result<Printer> {
        self.printers.create(printer).await
    }

    pub async fn set_status(&self, id: &str, status: PrinterStatus, at: DateTime<Utc>) -> Result<()> {
        let status = serde_json::to_value(status).map_err(crate::error::StoreError::Encode)?;
        self.printers
            .patch(id, patch! { "status" => status, "lastUpdated" => at.timestamp_millis() })
            .await?;
        tracing::info!(printer = id, status = %status, "printer status changed");
        Ok(())
    }

    pub async fn not_working(&self, site_id: Option<&str>) -> Result<Vec<Printer>> {
        let printers = self.list(site_id).await?;
        Ok(printers.into_iter().filter(|p| !p.status.is_working()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Os, PrinterKind};
    use crate::error::StoreError;
    use crate::managers::test_store;

    fn computer(site: &str, name: &str) -> Computer {
        Computer {
            id: String::new(),
            site_id: site.into(),
            name: name.into(),
            os: Os::Windows,
            section: None,
            last_cleaned: None,
        }
    }

    #[tokio::test]
    async fn test_computers_by_site_and_cleaning() {
        let manager = ComputersManager::new(test_store());
        let a = manager.create(&computer("s1", "PC-02")).await.unwrap();
        let b = manager.create(&computer("s1", "PC-01")).await.unwrap();
        manager.create(&computer("s2", "MAC-01")).await.unwrap();

        let names: Vec<String> = manager.list(Some("s1")).await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["PC-01", "PC-02"]);
        assert_eq!(manager.list(None).await.unwrap().len(), 3);

        let at = Utc::now();
        assert_eq!(manager.mark_all_cleaned(&[a.id.clone(), b.id.clone()], at).await.unwrap(), 2);
        let cleaned = manager.get(&a.id).await.unwrap().unwrap();
        assert_eq!(
            cleaned.last_cleaned.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_mark_cleaned_missing_computer() {
        let manager = ComputersManager::new(test_store());
        let err = manager.mark_cleaned("nope", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_printer_status() {
        let manager = PrintersManager::new(test_store());
        let printer = manager
            .create(&Printer {
                id: String::new(),
                site_id: "s1".into(),
                name: "HP 4050".into(),
                kind: PrinterKind::Bw,
                status: PrinterStatus::Working,
                last_updated: Utc::now(),
            })
            .await
            .unwrap();
        assert!(manager.not_working(Some("s1")).await.unwrap().is_empty());

        manager.set_status(&printer.id, PrinterStatus::OutOfToner, Utc::now()).await.unwrap();
        let broken = manager.not_working(Some("s1")).await.unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].status, PrinterStatus::OutOfToner);
    }
}
