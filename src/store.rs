use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    CohortYear, Student, StudentPatch, StudentYearSummary, YearProgress, YearSnapshot, YearWrite,
};

/// Document store the progress service reads from and writes to.
///
/// `commit_year` is all-or-nothing and refuses to apply when the stored
/// version no longer equals `expected_version`. The other writers are
/// single-document patches that report whether the target existed.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load_year(&self, student_id: &str, year: CohortYear) -> Result<YearSnapshot, StoreError>;

    /// Returns the new version.
    async fn commit_year(&self, write: &YearWrite) -> Result<i64, StoreError>;

    async fn reset_record_attempts(
        &self,
        student_id: &str,
        year: CohortYear,
        record_key: &str,
    ) -> Result<bool, StoreError>;

    /// Every student-year that has stored progress.
    async fn list_years(&self) -> Result<Vec<(String, CohortYear)>, StoreError>;

    async fn load_student(&self, student_id: &str) -> Result<Option<Student>, StoreError>;

    async fn list_students(&self) -> Result<Vec<Student>, StoreError>;

    async fn upsert_student(&self, student: &Student) -> Result<(), StoreError>;

    async fn update_student(
        &self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct StoredYear {
    progress: Option<YearProgress>,
    summary: Option<StudentYearSummary>,
    version: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    students: BTreeMap<String, Student>,
    years: BTreeMap<(String, CohortYear), StoredYear>,
}

/// Process-local store used for offline replays and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// While set, every operation fails as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[cfg(test)]
    /// Places a snapshot as-is, bypassing reconciliation. Used to load
    /// documents written by older clients.
    pub fn insert_snapshot(&self, student_id: &str, year: CohortYear, snapshot: YearSnapshot) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.years.insert(
            (student_id.to_string(), year),
            StoredYear {
                progress: snapshot.progress,
                summary: snapshot.summary,
                version: snapshot.version,
            },
        );
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load_year(&self, student_id: &str, year: CohortYear) -> Result<YearSnapshot, StoreError> {
        let state = self.lock()?;
        Ok(state
            .years
            .get(&(student_id.to_string(), year))
            .map(|stored| YearSnapshot {
                progress: stored.progress.clone(),
                summary: stored.summary.clone(),
                version: stored.version,
            })
            .unwrap_or_else(YearSnapshot::absent))
    }

    async fn commit_year(&self, write: &YearWrite) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        let stored = state
            .years
            .entry((write.student_id.clone(), write.year))
            .or_default();

        if stored.version != write.expected_version {
            return Err(StoreError::Conflict {
                student_id: write.student_id.clone(),
                year: write.year,
                expected: write.expected_version,
                found: stored.version,
            });
        }

        let mut progress = write.progress.clone();
        progress
            .records
            .insert(write.record.record_key.clone(), write.record.clone());
        stored.progress = Some(progress);
        stored.summary = Some(write.summary.clone());
        stored.version += 1;
        Ok(stored.version)
    }

    async fn reset_record_attempts(
        &self,
        student_id: &str,
        year: CohortYear,
        record_key: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(stored) = state.years.get_mut(&(student_id.to_string(), year)) else {
            return Ok(false);
        };
        let record = stored
            .progress
            .as_mut()
            .and_then(|progress| progress.records.get_mut(record_key));

        match record {
            Some(record) => {
                record.attempt_number = 1;
                record.attempt_history.clear();
                stored.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_years(&self) -> Result<Vec<(String, CohortYear)>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .years
            .iter()
            .filter(|(_, stored)| stored.progress.is_some() || stored.summary.is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn load_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        Ok(self.lock()?.students.get(student_id).cloned())
    }

    async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(self.lock()?.students.values().cloned().collect())
    }

    async fn upsert_student(&self, student: &Student) -> Result<(), StoreError> {
        self.lock()?
            .students
            .insert(student.id.clone(), student.clone());
        Ok(())
    }

    async fn update_student(
        &self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.students.get_mut(student_id) {
            Some(student) => {
                patch.apply(student, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::reconcile::reconcile;
    use crate::models::Submission;

    fn write_for(store_version: i64) -> YearWrite {
        let catalog = Catalog::for_year(CohortYear::First);
        let submission = Submission {
            total_questions: 5,
            correct_count: 4,
            answers: BTreeMap::new(),
        };
        let mut snapshot = YearSnapshot::absent();
        snapshot.version = store_version;
        let result = reconcile(catalog, "s1", &snapshot, 1, &submission, Utc::now()).unwrap();
        YearWrite {
            student_id: "s1".to_string(),
            year: CohortYear::First,
            expected_version: store_version,
            record: result.record,
            progress: result.progress,
            summary: result.summary,
        }
    }

    #[tokio::test]
    async fn commit_bumps_version_and_stores_documents() {
        let store = MemoryStore::new();
        assert_eq!(store.commit_year(&write_for(0)).await.unwrap(), 1);

        let snapshot = store.load_year("s1", CohortYear::First).await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.records().unwrap().contains_key("module1"));
        assert_eq!(snapshot.summary.unwrap().approved_levels, 1);
        assert_eq!(store.list_years().await.unwrap(), vec![("s1".to_string(), CohortYear::First)]);
    }

    #[tokio::test]
    async fn stale_version_is_rejected_without_changes() {
        let store = MemoryStore::new();
        store.commit_year(&write_for(0)).await.unwrap();

        let err = store.commit_year(&write_for(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, found: 1, .. }));
        assert_eq!(store.load_year("s1", CohortYear::First).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.load_year("s1", CohortYear::First).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.commit_year(&write_for(0)).await.is_err());

        store.set_unavailable(false);
        assert_eq!(store.load_year("s1", CohortYear::First).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn reset_reports_missing_records() {
        let store = MemoryStore::new();
        assert!(!store
            .reset_record_attempts("s1", CohortYear::First, "module1")
            .await
            .unwrap());
        store.commit_year(&write_for(0)).await.unwrap();
        assert!(store
            .reset_record_attempts("s1", CohortYear::First, "module1")
            .await
            .unwrap());
        assert_eq!(store.load_year("s1", CohortYear::First).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn student_patch_keeps_identity() {
        let store = MemoryStore::new();
        let student = Student {
            id: "ana".to_string(),
            full_name: "Ana Ruiz".to_string(),
            email: "ana@portal.edu".to_string(),
            username: "ana".to_string(),
            national_id: "0911111111".to_string(),
            phone: String::new(),
            age: Some(15),
            cohort_year: CohortYear::First,
            role: crate::models::Role::Student,
            penalized: false,
            penalty_reason: String::new(),
            registered_at: None,
            last_access: None,
        };
        store.upsert_student(&student).await.unwrap();

        let patch = StudentPatch {
            penalized: Some(true),
            penalty_reason: Some("shared answers".to_string()),
            age: Some(16),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(store.update_student("ana", &patch, now).await.unwrap());
        assert!(!store.update_student("ghost", &patch, now).await.unwrap());

        let updated = store.load_student("ana").await.unwrap().unwrap();
        assert!(updated.penalized);
        assert_eq!(updated.age, Some(16));
        assert_eq!(updated.email, student.email);
        assert_eq!(updated.last_access, Some(now));
        assert_eq!(store.list_students().await.unwrap().len(), 1);
    }
}
