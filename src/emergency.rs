use crate::error::{Error, Result};
use crate::logging::AuditLog;
use crate::metrics;
use crate::recovery::{CommandSpec, ProcessController};
use crate::snapshot::{BackupMetadata, SnapshotStore};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Emergency Recovery HTTP service
///
/// Runs on its own port so it stays reachable when the primary application
/// is down. Provides:
/// - GET /              - Operator page listing snapshots
/// - POST /restore      - Restore a snapshot `{"filename": "..."}`
/// - POST /auto-recover - Run one automatic recovery pass
/// - GET /health        - Service liveness
/// - GET /metrics       - Prometheus metrics
///
/// Restores and recovery passes run in a child `rsv-recovery` process so a
/// crash or hang there cannot take this service down.
pub struct EmergencyServer {
    listener: TcpListener,
    ctx: Arc<ServiceContext>,
}

/// Builds the worker command lines.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    global_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P, global_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
        }
    }

    /// `rsv-recovery` installed alongside the running executable.
    pub fn sibling(global_args: Vec<String>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let program = exe.with_file_name(format!("rsv-recovery{}", std::env::consts::EXE_SUFFIX));
        Ok(Self::new(program, global_args))
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new(self.program.clone())
            .args(self.global_args.iter().cloned())
            .args(args.iter().copied())
    }

    pub fn restore(&self, stem: &str) -> CommandSpec {
        self.spec(&["restore", stem])
    }

    pub fn recover(&self) -> CommandSpec {
        self.spec(&["recover"])
    }
}

pub struct ServiceContext {
    pub snapshots: SnapshotStore,
    pub process: Arc<dyn ProcessController>,
    pub worker: WorkerCommand,
    pub audit: Arc<AuditLog>,
    pub worker_timeout: Duration,
    /// Held while a worker runs; at most one worker at a time.
    worker_slot: Mutex<()>,
}

impl ServiceContext {
    pub fn new(
        snapshots: SnapshotStore,
        process: Arc<dyn ProcessController>,
        worker: WorkerCommand,
        audit: Arc<AuditLog>,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            snapshots,
            process,
            worker,
            audit,
            worker_timeout,
            worker_slot: Mutex::new(()),
        }
    }
}

impl EmergencyServer {
    pub fn bind(addr: &str, ctx: ServiceContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one thread each.
    pub fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Emergency recovery service listening");
        self.ctx
            .audit
            .info(&format!("Emergency recovery service started on http://{}", addr));

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let ctx = self.ctx.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &ctx) {
                            warn!(error = %e, "Error handling request");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }

        Ok(())
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.serve() {
                error!(error = %e, "Emergency server error");
            }
        })
    }
}

const MAX_BODY: usize = 64 * 1024;

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn failure(status: u16, message: &str) -> Self {
        Self::json(status, json!({"success": false, "error": message}))
    }

    fn success(&self) -> bool {
        self.status < 400
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ServiceContext) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;

    let response = match read_request(&stream) {
        Ok(Some(request)) => {
            let response = route(&request, ctx);
            let route_label = route_label(&request);
            metrics::record_emergency_request(route_label, response.success());
            ctx.audit.info(&format!(
                "{} {} -> {}",
                request.method, request.path, response.status
            ));
            response
        }
        Ok(None) => Response::failure(400, "Bad Request"),
        Err(e) => {
            warn!(error = %e, "Malformed request");
            Response::failure(400, "Bad Request")
        }
    };

    send_response(&mut stream, &response)
}

fn read_request(stream: &TcpStream) -> Result<Option<Request>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(None);
    }
    let method = parts[0].to_string();
    let path = parts[1].split('?').next().unwrap_or("/").to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                match value.trim().parse() {
                    Ok(n) => content_length = n,
                    Err(_) => return Ok(None),
                }
            }
        }
    }

    if content_length > MAX_BODY {
        return Ok(None);
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body)?;

    Ok(Some(Request { method, path, body }))
}

fn route(request: &Request, ctx: &ServiceContext) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => Response {
            status: 204,
            content_type: "text/plain",
            body: String::new(),
        },
        ("GET", "/") => handle_index(ctx),
        ("GET", "/health") => Response::json(
            200,
            json!({"status": "ok", "service": "rsv-emergency"}),
        ),
        ("GET", "/metrics") => match metrics::export() {
            Ok(text) => Response {
                status: 200,
                content_type: "text/plain; version=0.0.4",
                body: text,
            },
            Err(e) => Response::failure(500, &e.to_string()),
        },
        ("POST", "/restore") => handle_restore(&request.body, ctx),
        ("POST", "/auto-recover") => handle_auto_recover(ctx),
        _ => Response::failure(404, "Not Found"),
    }
}

fn route_label(request: &Request) -> &'static str {
    match request.path.as_str() {
        "/" => "index",
        "/restore" => "restore",
        "/auto-recover" => "auto_recover",
        "/health" => "health",
        "/metrics" => "metrics",
        _ => "other",
    }
}

#[derive(Deserialize)]
struct RestoreRequest {
    filename: String,
}

fn handle_restore(body: &[u8], ctx: &ServiceContext) -> Response {
    let request: RestoreRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return Response::failure(400, &format!("invalid request body: {}", e)),
    };
    let stem = match SnapshotStore::normalize_name(&request.filename) {
        Ok(stem) => stem,
        Err(e) => return Response::failure(400, &e.to_string()),
    };
    match ctx.snapshots.metadata(&stem) {
        Ok(_) => {}
        Err(Error::SnapshotNotFound(_)) => {
            return Response::failure(404, &format!("snapshot '{}' not found", stem))
        }
        Err(e) => return Response::failure(500, &e.to_string()),
    }

    ctx.audit
        .info(&format!("Emergency restore requested: {}", stem));
    run_worker(ctx, &ctx.worker.restore(&stem), &format!("Restored from {}", stem))
}

fn handle_auto_recover(ctx: &ServiceContext) -> Response {
    ctx.audit.info("Emergency auto-recovery requested");
    run_worker(ctx, &ctx.worker.recover(), "Automatic recovery completed")
}

fn run_worker(ctx: &ServiceContext, command: &CommandSpec, message: &str) -> Response {
    let Some(_slot) = ctx.worker_slot.try_lock() else {
        ctx.audit.warn("Rejected request: recovery already in progress");
        return Response::failure(409, "recovery already in progress");
    };

    let output = ctx
        .process
        .run_detached(command)
        .and_then(|handle| handle.wait_timeout(ctx.worker_timeout));

    match output {
        Ok(output) if output.success => {
            ctx.audit.info(message);
            Response::json(
                200,
                json!({"success": true, "message": message, "output": output.stdout}),
            )
        }
        Ok(output) => {
            let detail = if output.stderr.trim().is_empty() {
                format!("worker exited with code {:?}", output.code)
            } else {
                output.stderr.trim().to_string()
            };
            ctx.audit.error(&format!("Worker failed: {}", detail));
            Response::failure(500, &detail)
        }
        Err(e) => {
            ctx.audit.error(&format!("Worker failed: {}", e));
            Response::failure(500, &e.to_string())
        }
    }
}

fn handle_index(ctx: &ServiceContext) -> Response {
    match ctx.snapshots.list() {
        Ok(backups) => Response {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: render_index(&backups),
        },
        Err(e) => Response::failure(500, &e.to_string()),
    }
}

fn render_index(backups: &[BackupMetadata]) -> String {
    let mut rows = String::new();
    for backup in backups {
        let name = escape_html(&backup.filename);
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:.1} KB</td><td>{}</td>\
             <td><button data-filename=\"{}\" onclick=\"restore(this.dataset.filename)\">Restore</button></td></tr>\n",
            name,
            backup.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            backup.size as f64 / 1024.0,
            backup.kind.as_str(),
            name,
        ));
    }
    if backups.is_empty() {
        rows.push_str("<tr><td colspan=\"5\">No snapshots found</td></tr>\n");
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>RSVShop Emergency Recovery</title></head>
<body>
<h1>RSVShop Emergency Recovery</h1>
<p><button onclick="autoRecover()">Run automatic recovery</button></p>
<table border="1" cellpadding="4">
<tr><th>Snapshot</th><th>Created</th><th>Size</th><th>Type</th><th></th></tr>
{rows}</table>
<pre id="result"></pre>
<script>
function show(r) {{ r.json().then(j => document.getElementById('result').textContent = JSON.stringify(j, null, 2)); }}
function restore(f) {{
  if (!confirm('Restore ' + f + '? All current data will be replaced.')) return;
  fetch('/restore', {{method: 'POST', headers: {{'Content-Type': 'application/json'}}, body: JSON.stringify({{filename: f}})}}).then(show);
}}
function autoRecover() {{ fetch('/auto-recover', {{method: 'POST'}}).then(show); }}
</script>
</body>
</html>
"#
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn send_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_text = match response.status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\
         \r\n",
        response.status,
        status_text,
        response.content_type,
        response.body.len()
    );

    stream.write_all(head.as_bytes())?;
    stream.write_all(response.body.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{ProcessHandle, ProcessOutput};
    use crate::snapshot::{BackupKind, Snapshot};
    use crate::store::seed;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::{tempdir, TempDir};

    struct FakeHandle {
        output: ProcessOutput,
        delay: Duration,
        running: Arc<AtomicUsize>,
    }

    impl ProcessHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        fn wait_timeout(self: Box<Self>, _timeout: Duration) -> Result<ProcessOutput> {
            thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(self.output)
        }
    }

    struct FakeController {
        commands: Mutex<Vec<CommandSpec>>,
        output: ProcessOutput,
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: AtomicUsize,
    }

    impl ProcessController for FakeController {
        fn restart(&self, _service: &str) -> Result<()> {
            Ok(())
        }

        fn run_detached(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>> {
            self.commands.lock().push(command.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                output: self.output.clone(),
                delay: self.delay,
                running: self.running.clone(),
            }))
        }
    }

    fn start(success: bool) -> (TempDir, SocketAddr, Arc<FakeController>) {
        start_with_delay(success, Duration::ZERO)
    }

    fn start_with_delay(success: bool, delay: Duration) -> (TempDir, SocketAddr, Arc<FakeController>) {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path()).unwrap();
        snapshots
            .write("backup-2", &seed::baseline(), BackupKind::Manual)
            .unwrap();
        for name in ["backup-<b>", "backup-x');alert(1);('"] {
            snapshots
                .write(
                    name,
                    &Snapshot::new(chrono::Utc::now(), Default::default()),
                    BackupKind::Scheduled,
                )
                .unwrap();
        }

        let controller = Arc::new(FakeController {
            commands: Mutex::new(Vec::new()),
            output: ProcessOutput {
                success,
                code: Some(if success { 0 } else { 1 }),
                stdout: "done".to_string(),
                stderr: if success { String::new() } else { "Restore failed: boom".to_string() },
            },
            delay,
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        });
        let ctx = ServiceContext::new(
            snapshots,
            controller.clone(),
            WorkerCommand::new("rsv-recovery", vec!["--data-dir".into(), "/tmp/d".into()]),
            Arc::new(AuditLog::disabled()),
            Duration::from_secs(5),
        );
        let server = EmergencyServer::bind("127.0.0.1:0", ctx).unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        (dir, addr, controller)
    }

    fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String, String) {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        )
        .unwrap();
        read_response(&mut stream).unwrap()
    }

    fn read_response(stream: &mut TcpStream) -> Result<(u16, String, String)> {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line)?;

        let parts: Vec<&str> = status_line.split_whitespace().collect();
        let status_code = parts[1].parse::<u16>().unwrap();

        let mut headers = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if line.trim().is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = value.trim().parse::<usize>().unwrap();
            }
            headers.push_str(&line);
        }

        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok((status_code, headers, String::from_utf8(body).unwrap()))
    }

    #[test]
    fn test_health_endpoint() {
        let (_dir, addr, _) = start(true);
        let (status, headers, body) = request(addr, "GET", "/health", "");
        assert_eq!(status, 200);
        assert!(headers.contains("Access-Control-Allow-Origin: *"));
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn test_options_preflight() {
        let (_dir, addr, _) = start(true);
        let (status, headers, body) = request(addr, "OPTIONS", "/restore", "");
        assert_eq!(status, 204);
        assert!(headers.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_unknown_route_is_json_404() {
        let (_dir, addr, _) = start(true);
        let (status, _, body) = request(addr, "GET", "/admin", "");
        assert_eq!(status, 404);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_index_lists_escaped_snapshots() {
        let (_dir, addr, _) = start(true);
        let (status, headers, body) = request(addr, "GET", "/", "");
        assert_eq!(status, 200);
        assert!(headers.contains("text/html"));
        assert!(body.contains("backup-2.json"));
        assert!(body.contains("backup-&lt;b&gt;.json"));
        assert!(!body.contains("backup-<b>"));
    }

    #[test]
    fn test_index_keeps_filenames_out_of_script() {
        let (_dir, addr, _) = start(true);
        let (_, _, body) = request(addr, "GET", "/", "");
        assert!(body.contains(r#"data-filename="backup-x&#39;);alert(1);(&#39;.json""#));
        assert!(body.contains("restore(this.dataset.filename)"));
        assert!(!body.contains("restore('"));
        assert!(!body.contains("alert(1);('"));
    }

    #[test]
    fn test_overlapping_restores_run_one_worker() {
        let (_dir, addr, controller) = start_with_delay(true, Duration::from_millis(500));
        let barrier = Arc::new(Barrier::new(2));

        let clients: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    request(addr, "POST", "/restore", r#"{"filename":"backup-2"}"#)
                })
            })
            .collect();
        let mut results: Vec<(u16, String)> = clients
            .into_iter()
            .map(|c| {
                let (status, _, body) = c.join().unwrap();
                (status, body)
            })
            .collect();
        results.sort_by_key(|(status, _)| *status);

        assert_eq!(results[0].0, 200);
        assert_eq!(results[1].0, 409);
        let rejected: Value = serde_json::from_str(&results[1].1).unwrap();
        assert_eq!(rejected["success"], false);
        assert_eq!(rejected["error"], "recovery already in progress");
        assert_eq!(controller.peak.load(Ordering::SeqCst), 1);
        assert_eq!(controller.commands.lock().len(), 1);

        // The slot is free again once the worker has finished.
        let (status, _, _) = request(addr, "POST", "/auto-recover", "");
        assert_eq!(status, 200);
    }

    #[test]
    fn test_restore_runs_worker() {
        let (_dir, addr, controller) = start(true);
        let (status, _, body) = request(addr, "POST", "/restore", r#"{"filename":"backup-2.json"}"#);
        assert_eq!(status, 200);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Restored from backup-2");

        let commands = controller.commands.lock();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].program, PathBuf::from("rsv-recovery"));
        assert_eq!(commands[0].args, vec!["--data-dir", "/tmp/d", "restore", "backup-2"]);
    }

    #[test]
    fn test_restore_rejects_bad_filenames() {
        let (_dir, addr, controller) = start(true);
        let (status, _, _) = request(addr, "POST", "/restore", r#"{"filename":"../etc/passwd"}"#);
        assert_eq!(status, 400);
        let (status, _, _) = request(addr, "POST", "/restore", r#"{"filename":"backup-9"}"#);
        assert_eq!(status, 404);
        let (status, _, _) = request(addr, "POST", "/restore", "not json");
        assert_eq!(status, 400);
        assert!(controller.commands.lock().is_empty());
    }

    #[test]
    fn test_worker_failure_is_reported() {
        let (_dir, addr, _) = start(false);
        let (status, _, body) = request(addr, "POST", "/auto-recover", "");
        assert_eq!(status, 500);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Restore failed: boom");
    }

    #[test]
    fn test_auto_recover_runs_recover_command() {
        let (_dir, addr, controller) = start(true);
        let (status, _, _) = request(addr, "POST", "/auto-recover", "");
        assert_eq!(status, 200);
        assert_eq!(
            controller.commands.lock()[0].args.last().map(String::as_str),
            Some("recover")
        );
    }

    #[test]
    fn test_metrics_endpoint() {
        let (_dir, addr, _) = start(true);
        request(addr, "GET", "/health", "");
        let (status, headers, _) = request(addr, "GET", "/metrics", "");
        assert_eq!(status, 200);
        assert!(headers.contains("text/plain"));
    }
}
