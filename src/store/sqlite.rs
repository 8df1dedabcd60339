use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{NewJob, NewStep, NewTask, ReadyTask, RecordStore};
use crate::error::{Error, Result};
use crate::model::{
    FileType, Job, JobStatus, Patch, Record, RecordGroup, RecordKind, Step, StepKind, Task,
    TaskStatus, VmRole, VmState, VmStatus, VmType,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vms (
    name TEXT PRIMARY KEY,
    vm_type TEXT NOT NULL,
    role TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    idle_snapshot TEXT NOT NULL,
    status TEXT NOT NULL,
    child_pid INTEGER,
    child_deadline INTEGER,
    errors INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    details TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL,
    remarks TEXT NOT NULL DEFAULT '',
    user TEXT NOT NULL,
    patch_id INTEGER,
    submitted INTEGER NOT NULL,
    ended INTEGER,
    status TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS steps (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    no INTEGER NOT NULL,
    previous_no INTEGER,
    kind TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_name TEXT,
    in_staging INTEGER NOT NULL DEFAULT 0,
    debug_level INTEGER NOT NULL DEFAULT 0,
    report_successful_tests INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, no)
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    step_no INTEGER NOT NULL,
    no INTEGER NOT NULL,
    vm TEXT,
    cmd_line_arg TEXT,
    timeout_secs INTEGER NOT NULL,
    status TEXT NOT NULL,
    test_failures INTEGER NOT NULL DEFAULT 0,
    started INTEGER,
    ended INTEGER,
    FOREIGN KEY (job_id, step_no) REFERENCES steps(job_id, no) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS record_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    group_id INTEGER NOT NULL REFERENCES record_groups(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_patch_sets (
    msgid TEXT PRIMARY KEY,
    received INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS patches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msgid TEXT NOT NULL,
    received INTEGER NOT NULL,
    disposition TEXT NOT NULL DEFAULT ''
);
"#;

/// `RecordStore` implementation backed by SQLite. The same implementation
/// opens a real file in production (so unrelated OS processes share the
/// durable state) and `:memory:` in tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| Error::Store {
            message: format!("failed to open database at {}: {err}", path.display()),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn store_err(err: rusqlite::Error) -> Error {
    Error::Store {
        message: err.to_string(),
    }
}

fn row_to_vm(row: &rusqlite::Row) -> rusqlite::Result<VmState> {
    let vm_type: String = row.get("vm_type")?;
    let role: String = row.get("role")?;
    let status: String = row.get("status")?;
    Ok(VmState {
        name: row.get("name")?,
        vm_type: VmType::parse(&vm_type).unwrap_or(VmType::Build),
        role: VmRole::parse(&role).unwrap_or(VmRole::Extra),
        sort_order: row.get("sort_order")?,
        idle_snapshot: row.get("idle_snapshot")?,
        status: VmStatus::parse(&status).unwrap_or(VmStatus::Offline),
        child_pid: row.get("child_pid")?,
        child_deadline: row.get("child_deadline")?,
        errors: row.get::<_, i64>("errors")? as u32,
        description: row.get("description")?,
        details: row.get("details")?,
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        priority: row.get::<_, i64>("priority")? as u8,
        remarks: row.get("remarks")?,
        user: row.get("user")?,
        patch_id: row.get("patch_id")?,
        submitted: row.get("submitted")?,
        ended: row.get("ended")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::BotError),
        archived: row.get::<_, i64>("archived")? != 0,
    })
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<Step> {
    let kind: String = row.get("kind")?;
    let file_type: String = row.get("file_type")?;
    Ok(Step {
        job_id: row.get("job_id")?,
        no: row.get("no")?,
        previous_no: row.get("previous_no")?,
        kind: StepKind::parse(&kind).unwrap_or(StepKind::Build),
        file_type: FileType::parse(&file_type).unwrap_or(FileType::None),
        file_name: row.get("file_name")?,
        in_staging: row.get::<_, i64>("in_staging")? != 0,
        debug_level: row.get::<_, i64>("debug_level")? as u8,
        report_successful_tests: row.get::<_, i64>("report_successful_tests")? != 0,
    })
}

fn row_to_patch(row: &rusqlite::Row) -> rusqlite::Result<Patch> {
    Ok(Patch {
        id: row.get("id")?,
        msgid: row.get("msgid")?,
        received: row.get("received")?,
        disposition: row.get("disposition")?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    Ok(Task {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        step_no: row.get("step_no")?,
        no: row.get("no")?,
        vm: row.get("vm")?,
        cmd_line_arg: row.get("cmd_line_arg")?,
        timeout_secs: row.get::<_, i64>("timeout_secs")? as u64,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::BotError),
        test_failures: row.get::<_, i64>("test_failures")? as u32,
        started: row.get("started")?,
        ended: row.get("ended")?,
    })
}

impl RecordStore for SqliteStore {
    fn insert_vm(&self, vm: VmState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO vms (name, vm_type, role, sort_order, idle_snapshot, status, child_pid, child_deadline, errors, description, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                vm.name,
                vm.vm_type.as_str(),
                vm.role.as_str(),
                vm.sort_order,
                vm.idle_snapshot,
                vm.status.as_str(),
                vm.child_pid,
                vm.child_deadline,
                vm.errors as i64,
                vm.description,
                vm.details,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn get_vm(&self, name: &str) -> Result<Option<VmState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM vms WHERE name = ?1", params![name], row_to_vm)
            .optional()
            .map_err(store_err)
    }

    fn list_vms(&self) -> Result<Vec<VmState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM vms ORDER BY sort_order, name")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_vm)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    fn delete_vm(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute("DELETE FROM vms WHERE name = ?1", params![name])
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn cas_vm_status(&self, name: &str, expected: VmStatus, new: VmStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE vms SET status = ?1 WHERE name = ?2 AND status = ?3",
                params![new.as_str(), name, expected.as_str()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn set_vm_child(&self, name: &str, pid: Option<i32>, deadline: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE vms SET child_pid = ?1, child_deadline = ?2 WHERE name = ?3",
            params![pid, deadline, name],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn record_vm_error(&self, name: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE vms SET errors = errors + 1 WHERE name = ?1",
            params![name],
        )
        .map_err(store_err)?;
        let errors: i64 = conn
            .query_row("SELECT errors FROM vms WHERE name = ?1", params![name], |r| r.get(0))
            .map_err(store_err)?;
        Ok(errors as u32)
    }

    fn reset_vm_errors(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE vms SET errors = 0 WHERE name = ?1", params![name])
            .map_err(store_err)?;
        Ok(())
    }

    fn insert_job(&self, job: NewJob) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (priority, remarks, user, patch_id, submitted, ended, status, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'queued', 0)",
            params![
                job.priority as i64,
                job.remarks,
                job.user,
                job.patch_id,
                job.submitted
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .map_err(store_err)
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY id").map_err(store_err)?;
        stmt.query_map([], row_to_job)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)
    }

    fn set_job_status(&self, id: i64, status: JobStatus, ended: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = ?1, ended = ?2 WHERE id = ?3",
            params![status.as_str(), ended, id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn delete_job(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(())
    }

    fn insert_step(&self, job_id: i64, step: NewStep) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO steps (job_id, no, previous_no, kind, file_type, file_name, in_staging, debug_level, report_successful_tests)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job_id,
                step.no,
                step.previous_no,
                step.kind.as_str(),
                step.file_type.as_str(),
                step.file_name,
                step.in_staging as i64,
                step.debug_level as i64,
                step.report_successful_tests as i64,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn get_step(&self, job_id: i64, no: i64) -> Result<Option<Step>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM steps WHERE job_id = ?1 AND no = ?2",
            params![job_id, no],
            row_to_step,
        )
        .optional()
        .map_err(store_err)
    }

    fn list_steps(&self, job_id: i64) -> Result<Vec<Step>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM steps WHERE job_id = ?1 ORDER BY no")
            .map_err(store_err)?;
        stmt.query_map(params![job_id], row_to_step)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)
    }

    fn insert_task(&self, job_id: i64, step_no: i64, task: NewTask) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (job_id, step_no, no, vm, cmd_line_arg, timeout_secs, status, test_failures, started, ended)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0, NULL, NULL)",
            params![
                job_id,
                step_no,
                task.no,
                task.vm,
                task.cmd_line_arg,
                task.timeout_secs as i64,
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()
            .map_err(store_err)
    }

    fn list_tasks_for_step(&self, job_id: i64, step_no: i64) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM tasks WHERE job_id = ?1 AND step_no = ?2 ORDER BY no")
            .map_err(store_err)?;
        stmt.query_map(params![job_id, step_no], row_to_task)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)
    }

    fn list_tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM tasks WHERE job_id = ?1 ORDER BY step_no, no")
            .map_err(store_err)?;
        stmt.query_map(params![job_id], row_to_task)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)
    }

    fn cas_task_status(&self, id: i64, expected: TaskStatus, new: TaskStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![new.as_str(), id, expected.as_str()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn set_task_status(&self, id: i64, new: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![new.as_str(), id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn set_task_vm(&self, id: i64, vm: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE tasks SET vm = ?1 WHERE id = ?2", params![vm, id])
            .map_err(store_err)?;
        Ok(())
    }

    fn record_task_failure(&self, id: i64) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET test_failures = test_failures + 1 WHERE id = ?1",
            params![id],
        )
        .map_err(store_err)?;
        let failures: i64 = conn
            .query_row(
                "SELECT test_failures FROM tasks WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        Ok(failures as u32)
    }

    fn set_task_test_failures(&self, id: i64, count: u32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET test_failures = ?1 WHERE id = ?2",
            params![count as i64, id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn set_task_times(&self, id: i64, started: Option<i64>, ended: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET started = COALESCE(?1, started), ended = ?2 WHERE id = ?3",
            params![started, ended, id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn list_ready_tasks(&self) -> Result<Vec<ReadyTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT t.* FROM tasks t
                 JOIN steps s ON s.job_id = t.job_id AND s.no = t.step_no
                 JOIN jobs j ON j.id = t.job_id
                 WHERE t.status = 'queued'
                   AND j.status NOT IN ('canceled', 'completed', 'boterror')
                   AND (s.previous_no IS NULL OR EXISTS (
                        SELECT 1 FROM tasks pt
                        WHERE pt.job_id = s.job_id AND pt.step_no = s.previous_no
                        GROUP BY pt.job_id, pt.step_no
                        HAVING COUNT(*) = SUM(CASE WHEN pt.status = 'completed' THEN 1 ELSE 0 END)
                   ))
                 ORDER BY j.priority ASC, j.id ASC, t.step_no ASC, t.no ASC",
            )
            .map_err(store_err)?;
        let tasks = stmt
            .query_map([], row_to_task)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            let job = conn
                .query_row("SELECT * FROM jobs WHERE id = ?1", params![task.job_id], row_to_job)
                .map_err(store_err)?;
            let step = conn
                .query_row(
                    "SELECT * FROM steps WHERE job_id = ?1 AND no = ?2",
                    params![task.job_id, task.step_no],
                    row_to_step,
                )
                .map_err(store_err)?;
            out.push(ReadyTask { job, step, task });
        }
        Ok(out)
    }

    fn cancel_orphaned_dependents(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT t.id FROM tasks t
                 JOIN steps s ON s.job_id = t.job_id AND s.no = t.step_no
                 WHERE t.status = 'queued'
                   AND s.previous_no IS NOT NULL
                   AND EXISTS (
                        SELECT 1 FROM tasks pt
                        WHERE pt.job_id = s.job_id AND pt.step_no = s.previous_no
                        GROUP BY pt.job_id, pt.step_no
                        HAVING SUM(CASE WHEN pt.status IN ('queued','running') THEN 1 ELSE 0 END) = 0
                           AND SUM(CASE WHEN pt.status != 'completed' THEN 1 ELSE 0 END) > 0
                   )",
            )
            .map_err(store_err)?;
        let ids: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        for id in &ids {
            conn.execute(
                "UPDATE tasks SET status = 'canceled' WHERE id = ?1",
                params![id],
            )
            .map_err(store_err)?;
        }
        Ok(ids)
    }

    fn roll_up_job_statuses(&self, now_unix: i64) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();

        // A `queued` Job whose Tasks have started moving is now `running`.
        conn.execute(
            "UPDATE jobs SET status = 'running'
             WHERE status = 'queued'
               AND EXISTS (SELECT 1 FROM tasks WHERE tasks.job_id = jobs.id AND tasks.status != 'queued')",
            [],
        )
        .map_err(store_err)?;

        // A Job with at least one Task, none of which is still
        // queued/running, is terminal: `boterror` if any Task ended
        // `boterror`, `completed` otherwise (spec.md §8 E2: a badpatch
        // build and its canceled dependents still finish the Job).
        let mut stmt = conn
            .prepare(
                "SELECT jobs.id FROM jobs
                 WHERE jobs.status IN ('queued', 'running')
                   AND EXISTS (SELECT 1 FROM tasks WHERE tasks.job_id = jobs.id)
                   AND NOT EXISTS (
                        SELECT 1 FROM tasks
                        WHERE tasks.job_id = jobs.id AND tasks.status IN ('queued', 'running')
                   )",
            )
            .map_err(store_err)?;
        let ids: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        drop(stmt);

        let mut finalized = Vec::with_capacity(ids.len());
        for id in ids {
            let has_boterror: bool = conn
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM tasks WHERE job_id = ?1 AND status = 'boterror')",
                    params![id],
                    |r| r.get(0),
                )
                .map_err(store_err)?;
            let status = if has_boterror { JobStatus::BotError } else { JobStatus::Completed };
            conn.execute(
                "UPDATE jobs SET status = ?1, ended = ?2 WHERE id = ?3",
                params![status.as_str(), now_unix, id],
            )
            .map_err(store_err)?;
            let job = conn
                .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
                .map_err(store_err)?;
            finalized.push(job);
        }
        Ok(finalized)
    }

    fn get_patch(&self, id: i64) -> Result<Option<Patch>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM patches WHERE id = ?1", params![id], row_to_patch)
            .optional()
            .map_err(store_err)
    }

    fn append_record_group(&self, group: RecordGroup) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute(
            "INSERT INTO record_groups (timestamp) VALUES (?1)",
            params![group.timestamp],
        )
        .map_err(store_err)?;
        let group_id = tx.last_insert_rowid();
        for record in &group.records {
            tx.execute(
                "INSERT INTO records (group_id, kind, name, value) VALUES (?1, ?2, ?3, ?4)",
                params![group_id, record.kind.as_str(), record.name, record.value],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(group_id)
    }

    fn delete_record_groups_older_than(&self, cutoff_unix: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM record_groups WHERE timestamp < ?1",
                params![cutoff_unix],
            )
            .map_err(store_err)?;
        Ok(changed as u64)
    }

    fn discard_stale_pending_patch_sets(&self, cutoff_unix: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM pending_patch_sets WHERE received < ?1",
                params![cutoff_unix],
            )
            .map_err(store_err)?;
        Ok(changed as u64)
    }

    fn delete_unreferenced_patches_older_than(&self, cutoff_unix: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM patches WHERE received < ?1 AND id NOT IN (SELECT patch_id FROM jobs WHERE patch_id IS NOT NULL)",
                params![cutoff_unix],
            )
            .map_err(store_err)?;
        Ok(changed as u64)
    }

    fn delete_jobs_ended_before(&self, cutoff_unix: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id FROM jobs WHERE ended IS NOT NULL AND ended < ?1")
            .map_err(store_err)?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff_unix], |r| r.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        for id in &ids {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
                .map_err(store_err)?;
        }
        Ok(ids)
    }

    fn archive_jobs_ended_before(&self, cutoff_unix: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM jobs WHERE ended IS NOT NULL AND ended < ?1 AND archived = 0",
            )
            .map_err(store_err)?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff_unix], |r| r.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        for id in &ids {
            conn.execute("UPDATE jobs SET archived = 1 WHERE id = ?1", params![id])
                .map_err(store_err)?;
        }
        Ok(ids)
    }

    fn delete_deleted_vms_without_task_refs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM vms WHERE role = 'deleted' AND name NOT IN (SELECT vm FROM tasks WHERE vm IS NOT NULL AND status IN ('queued','running'))",
            )
            .map_err(store_err)?;
        let names: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        for name in &names {
            conn.execute("DELETE FROM vms WHERE name = ?1", params![name])
                .map_err(store_err)?;
        }
        Ok(names)
    }
}
