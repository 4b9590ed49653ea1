use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::CondoClock;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-condominium engines. Each condominium gets its own Engine + WAL +
/// compactor. Condominium = database name from the pgwire connection.
pub struct CondoManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    clock: CondoClock,
}

impl CondoManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, clock: CondoClock) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            clock,
        }
    }

    /// Get or lazily open the engine for a condominium.
    ///
    /// Engines are keyed by the sanitized name, the same one that names the
    /// WAL file: names that differ only in stripped characters share one
    /// engine and one writer.
    pub fn get_or_create(&self, condo: &str) -> std::io::Result<Arc<Engine>> {
        if condo.len() > MAX_CONDO_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "condominium name too long",
            ));
        }

        // Keep WAL files inside data_dir
        let safe_name: String = condo
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty condominium name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_CONDOS {
            return Err(std::io::Error::other("too many condominiums"));
        }

        // Two connections may race to open the same condominium; the entry
        // lock makes the loser reuse the winner's engine.
        let entry = self.engines.entry(safe_name.clone());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.clock)?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!(condo = %safe_name, "condominium opened");
        metrics::gauge!(crate::observability::CONDOS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("condobook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> CondoManager {
        CondoManager::new(dir, 1000, CondoClock::new(chrono_tz::America::Sao_Paulo))
    }

    #[tokio::test]
    async fn condo_isolation() {
        let dir = test_data_dir("isolation");
        let cm = manager(dir);

        let eng_a = cm.get_or_create("residencial_a").unwrap();
        let eng_b = cm.get_or_create("residencial_b").unwrap();

        let area_id = Ulid::new();
        eng_a.create_area(area_id, AreaSpec::named("Pool")).await.unwrap();
        eng_b.create_area(area_id, AreaSpec::named("Pool")).await.unwrap();

        let span = Span::new(1_792_000_800_000, 1_792_004_400_000);
        let request = ReservationRequest {
            area_id,
            span,
            owner: None,
            reason: None,
        };
        eng_a
            .request_reservation(Ulid::new(), request.clone(), Actor::Admin)
            .await
            .unwrap();

        // Same slot is still free next door
        eng_b.check_availability(area_id, span).await.unwrap();
        eng_b
            .request_reservation(Ulid::new(), request, Actor::Admin)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn condo_lazy_creation() {
        let dir = test_data_dir("lazy");
        let cm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = cm.get_or_create("my_condo").unwrap();
        assert!(dir.join("my_condo.wal").exists());
    }

    #[tokio::test]
    async fn condo_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let cm = manager(dir);

        let eng1 = cm.get_or_create("foo").unwrap();
        let eng2 = cm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn condo_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let cm = manager(dir.clone());

        let _eng = cm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(cm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_wal_share_an_engine() {
        let dir = test_data_dir("shared_wal");
        let area_id = Ulid::new();
        {
            let cm = manager(dir.clone());
            let dotted = cm.get_or_create("tower.a").unwrap();
            let plain = cm.get_or_create("towera").unwrap();
            assert!(Arc::ptr_eq(&dotted, &plain));

            dotted
                .create_area(area_id, AreaSpec::named("Pool"))
                .await
                .unwrap();
            assert!(matches!(
                plain.create_area(area_id, AreaSpec::named("Pool")).await,
                Err(EngineError::AlreadyExists(_))
            ));
        }
        let wals: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(wals.len(), 1);

        let cm = manager(dir);
        let engine = cm.get_or_create("towera").unwrap();
        assert_eq!(engine.list_areas().await.len(), 1);
    }

    #[tokio::test]
    async fn condo_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let cm = manager(dir);

        let long_name = "x".repeat(MAX_CONDO_NAME_LEN + 1);
        let err = cm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("condominium name too long"));
    }

    #[tokio::test]
    async fn condo_state_survives_reopen() {
        let dir = test_data_dir("reopen");
        let area_id = Ulid::new();
        {
            let cm = manager(dir.clone());
            let engine = cm.get_or_create("torre_norte").unwrap();
            engine
                .create_area(area_id, AreaSpec::named("Gourmet"))
                .await
                .unwrap();
        }
        let cm = manager(dir);
        let engine = cm.get_or_create("torre_norte").unwrap();
        assert_eq!(engine.get_area(area_id).await.unwrap().name, "Gourmet");
    }
}
