use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use spanner_crm::api::{build_router, AppState};
use spanner_crm::config::{self, Config};
use spanner_crm::db::{self, users};
use spanner_crm::model::Role;

struct TestApp {
    router: Router,
    state: AppState,
}

impl TestApp {
    async fn new() -> Self {
        let pool = db::init_memory_pool().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        let state = AppState::new(pool, cfg);
        Self {
            router: build_router(state.clone()),
            state,
        }
    }

    /// Creates a user and returns an access token for it.
    async fn user_token(&self, email: &str, roles: &[Role]) -> (Uuid, String) {
        let mut tx = self.state.pool.begin().await.unwrap();
        let user = users::create_user_tx(
            &mut tx,
            users::NewUser {
                email,
                name: "Test User",
                password_hash: "not-a-hash",
                roles,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        let token = self.state.tokens.issue_access(user.user.id).unwrap();
        (user.user.id, token)
    }

    async fn send(&self, req: Request<Body>) -> Response {
        self.router.clone().oneshot(req).await.unwrap()
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.send(req).await;
        let status = resp.status();
        (status, json_body(resp).await)
    }
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn json_body(resp: Response) -> Value {
    let bytes = body_bytes(resp).await;
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}

async fn create_segment(app: &TestApp, token: &str) -> String {
    create_named_segment(app, token, "Mid-market SaaS").await
}

async fn create_named_segment(app: &TestApp, token: &str, name: &str) -> String {
    let (status, body) = app
        .call(
            "POST",
            "/api/v1/segments",
            Some(token),
            Some(json!({ "name": name, "research_filter_requirements": "50-500 staff" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

async fn create_company(app: &TestApp, token: &str, segment: &str, name: &str) -> String {
    let (status, body) = app
        .call(
            "POST",
            "/api/v1/companies",
            Some(token),
            Some(json!({ "segment_id": segment, "company_name": name })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

async fn create_contact(app: &TestApp, token: &str, company: &str, email: &str) -> String {
    let (status, body) = app
        .call(
            "POST",
            "/api/v1/contacts",
            Some(token),
            Some(json!({
                "company_id": company,
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": email
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

async fn export_lines(app: &TestApp, token: &str, uri: &str) -> Vec<String> {
    let req = Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains(".csv"));
    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    text.lines().map(str::to_string).collect()
}

#[tokio::test]
async fn health_needs_no_token() {
    let app = TestApp::new().await;
    for uri in ["/health", "/api/v1/health"] {
        let (status, body) = app.call("GET", uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "spanner-crm");
        assert!(body["version"].is_string());
    }
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let app = TestApp::new().await;
    let (status, body) = app.call("GET", "/api/v1/companies", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["detail"].is_string());

    let (status, _) = app
        .call("GET", "/api/v1/companies", Some("garbage"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_refresh_and_me() {
    let app = TestApp::new().await;
    let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    let admin = cfg.auth.bootstrap_admin.unwrap();
    spanner_crm::auth::seed_bootstrap_admin(&app.state.pool, &admin)
        .await
        .unwrap()
        .unwrap();

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": admin.email, "password": "wrong" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, tokens) = app
        .call(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": admin.email, "password": admin.password })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tokens["token_type"], "bearer");
    let access = tokens["access_token"].as_str().unwrap().to_string();
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    // refresh tokens do not authenticate requests
    let (status, _) = app.call("GET", "/api/v1/auth/me", Some(&refresh), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, me) = app.call("GET", "/api/v1/auth/me", Some(&access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["roles"], json!(["admin"]));
    assert!(me["password_hash"].is_null());
    let perms: Vec<&str> = me["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(perms.contains(&"manage_users"));

    let (status, fresh) = app
        .call(
            "POST",
            "/api/v1/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(fresh["access_token"].is_string());
}

#[tokio::test]
async fn deactivated_users_are_forbidden() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (sdr_id, sdr) = app.user_token("sdr@example.com", &[Role::Sdr]).await;

    let (status, body) = app
        .call("POST", &format!("/api/v1/users/{sdr_id}/deactivate"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "deactivated");

    let (status, _) = app.call("GET", "/api/v1/notifications", Some(&sdr), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn wrong_role_is_forbidden() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, marketing) = app.user_token("m@example.com", &[Role::Marketing]).await;
    let segment = create_segment(&app, &admin).await;

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/companies",
            Some(&marketing),
            Some(json!({ "segment_id": segment, "company_name": "Acme" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call("GET", "/api/v1/audit-logs", Some(&marketing), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn company_approval_flow() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (researcher_id, researcher) = app.user_token("r@example.com", &[Role::Researcher]).await;
    let (_, approver) = app.user_token("a@example.com", &[Role::Approver]).await;
    let segment = create_segment(&app, &admin).await;

    let (status, company) = app
        .call(
            "POST",
            "/api/v1/companies",
            Some(&researcher),
            Some(json!({
                "segment_id": segment,
                "company_name": "Acme",
                "company_website": "acme.com",
                "founded_year": 1949
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{company}");
    assert_eq!(company["status"], "pending");
    let id = company["id"].as_str().unwrap().to_string();
    let approve = format!("/api/v1/companies/{id}/approve");

    // rejected without a reason never reaches the store
    let (status, body) = app
        .call("POST", &approve, Some(&approver), Some(json!({ "status": "rejected" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("rejection_reason"));

    // researchers cannot decide
    let (status, _) = app
        .call("POST", &approve, Some(&researcher), Some(json!({ "status": "approved" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .call("POST", &approve, Some(&approver), Some(json!({ "status": "approved" })))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "approved");

    let (status, _) = app
        .call("POST", &approve, Some(&approver), Some(json!({ "status": "approved" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, inbox) = app
        .call("GET", "/api/v1/notifications/unread-count", Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox["unread"], 1);

    let (status, logs) = app
        .call(
            "GET",
            &format!("/api/v1/audit-logs?entity_type=company&entity_id={id}"),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = logs["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    assert_eq!(actions, vec!["company.decide", "company.create"]);
    assert!(logs["items"][1]["actor_id"] == json!(researcher_id.to_string()));
}

#[tokio::test]
async fn duplicate_company_conflicts() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let segment = create_segment(&app, &admin).await;
    let body = json!({ "segment_id": segment, "company_name": "Acme", "company_website": "acme.com" });

    let (status, _) = app
        .call("POST", "/api/v1/companies", Some(&admin), Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, err) = app
        .call("POST", "/api/v1/companies", Some(&admin), Some(body))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(err["detail"].is_string());
}

fn multipart(boundary: &str, segment_id: &str, file_name: &str, csv: &str) -> Body {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"segment_id\"\r\n\r\n{segment_id}\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
         Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
        b = boundary
    );
    Body::from(body)
}

fn upload_request(token: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/uploads/companies")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn company_csv_upload_and_export() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, researcher) = app.user_token("r@example.com", &[Role::Researcher]).await;
    let segment = create_segment(&app, &admin).await;

    let csv = "company_name,company_website,founded_year\nAcme,acme.com,1949\nGlobex,globex.com,oops\nAcme,acme.com,\n";
    let resp = app
        .send(upload_request(
            &researcher,
            multipart("XBOUNDARY", &segment, "companies.csv", csv),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let outcome = json_body(resp).await;
    assert_eq!(outcome["total_rows"], 3);
    assert_eq!(outcome["valid_rows"], 2);
    assert_eq!(outcome["invalid_rows"], 1);
    assert_eq!(outcome["status"], "failed");
    assert_eq!(outcome["duplicates_marked"], 1);
    assert_eq!(outcome["errors"][0]["row_number"], 2);
    assert_eq!(outcome["errors"][0]["field"], "founded_year");

    let report = outcome["error_report_url"].as_str().unwrap().to_string();
    let (status, errors) = app.call("GET", &report, Some(&researcher), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(errors["errors"].as_array().unwrap().len(), 1);

    // wrong extension is rejected before processing
    let resp = app
        .send(upload_request(
            &researcher,
            multipart("XBOUNDARY", &segment, "companies.txt", csv),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .uri(format!("/api/v1/exports/companies?segment_id={segment}&is_duplicate=false"))
        .header(header::AUTHORIZATION, format!("Bearer {admin}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2, "{text}");
    assert!(lines[0].starts_with("id,"));
    assert!(lines[1].contains("Acme"));
}

#[tokio::test]
async fn contact_assignment_over_http() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (sdr_id, sdr) = app.user_token("sdr@example.com", &[Role::Sdr]).await;
    let segment = create_segment(&app, &admin).await;
    let (_, company) = app
        .call(
            "POST",
            "/api/v1/companies",
            Some(&admin),
            Some(json!({ "segment_id": segment, "company_name": "Initech" })),
        )
        .await;
    let (status, contact) = app
        .call(
            "POST",
            "/api/v1/contacts",
            Some(&admin),
            Some(json!({
                "company_id": company["id"],
                "first_name": "Peter",
                "last_name": "Gibbons",
                "email": "peter@initech.com"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{contact}");
    let id = contact["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .call(
            "POST",
            &format!("/api/v1/contacts/{id}/assign"),
            Some(&admin),
            Some(json!({ "assigned_sdr_id": sdr_id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call("POST", &format!("/api/v1/contacts/{id}/approve"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .call(
            "POST",
            &format!("/api/v1/contacts/{id}/assign"),
            Some(&admin),
            Some(json!({ "assigned_sdr_id": null })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(
            "POST",
            &format!("/api/v1/contacts/{id}/assign"),
            Some(&admin),
            Some(json!({ "assigned_sdr_id": sdr_id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "assigned_to_sdr");

    let (status, body) = app
        .call(
            "POST",
            &format!("/api/v1/contacts/{id}/meeting-scheduled"),
            Some(&sdr),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "meeting_scheduled");

    let (status, mine) = app
        .call("GET", "/api/v1/notifications?unread_only=true", Some(&sdr), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["total"], 1);
    assert_eq!(mine["items"][0]["kind"], "contact_assigned");
}

#[tokio::test]
async fn assignments_check_their_target() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (owner_id, owner) = app.user_token("owner@example.com", &[Role::SegmentOwner]).await;
    let segment = create_segment(&app, &admin).await;

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/assignments",
            Some(&admin),
            Some(json!({ "entity_type": "company", "entity_id": Uuid::new_v4(), "assigned_to": owner_id })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let payload = json!({ "entity_type": "segment", "entity_id": segment, "assigned_to": owner_id });
    let (status, created) = app
        .call("POST", "/api/v1/assignments", Some(&admin), Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let (status, _) = app
        .call("POST", "/api/v1/assignments", Some(&admin), Some(payload))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, mine) = app.call("GET", "/api/v1/assignments/me", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["total"], 1);
    assert_eq!(mine["items"][0]["entity_type"], "segment");

    let (status, _) = app
        .call(
            "DELETE",
            &format!("/api/v1/assignments/{}", created["id"].as_str().unwrap()),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn segment_lifecycle_and_offerings() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, researcher) = app.user_token("r@example.com", &[Role::Researcher]).await;

    let (status, cloud) = app
        .call("POST", "/api/v1/offerings", Some(&admin), Some(json!({ "name": "Cloud Migration" })))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{cloud}");
    assert_eq!(cloud["status"], "active");
    let cloud_id = cloud["id"].as_str().unwrap().to_string();
    let (status, _) = app
        .call("POST", "/api/v1/offerings", Some(&admin), Some(json!({ "name": "Data Audit" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app
        .call("POST", "/api/v1/offerings", Some(&admin), Some(json!({ "name": "Data Audit" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = app
        .call("POST", "/api/v1/offerings", Some(&researcher), Some(json!({ "name": "Nope" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, retired) = app
        .call(
            "PATCH",
            &format!("/api/v1/offerings/{cloud_id}"),
            Some(&admin),
            Some(json!({ "status": "inactive" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{retired}");
    assert_eq!(retired["status"], "inactive");
    assert_eq!(retired["name"], "Cloud Migration");
    let (_, active) = app
        .call("GET", "/api/v1/offerings?status=active", Some(&researcher), None)
        .await;
    assert_eq!(active["total"], 1);
    assert_eq!(active["items"][0]["name"], "Data Audit");
    let (status, fetched) = app
        .call("GET", &format!("/api/v1/offerings/{cloud_id}"), Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], cloud_id.as_str());

    let segment = create_segment(&app, &admin).await;
    let (status, updated) = app
        .call(
            "PATCH",
            &format!("/api/v1/segments/{segment}"),
            Some(&admin),
            Some(json!({ "description": "North America only", "offering_ids": [cloud_id] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["description"], "North America only");
    assert_eq!(updated["name"], "Mid-market SaaS");

    let company = create_company(&app, &admin, &segment, "Acme").await;
    create_company(&app, &admin, &segment, "Globex").await;
    create_contact(&app, &admin, &company, "ada@acme.com").await;

    let (status, stats) = app
        .call("GET", &format!("/api/v1/segments/{segment}/stats"), Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["company_count"], 2);
    assert_eq!(stats["pending_company_count"], 2);
    assert_eq!(stats["contact_count"], 1);

    let (status, detail) = app
        .call("GET", &format!("/api/v1/segments/{segment}"), Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["offerings"].as_array().unwrap().len(), 1);
    assert_eq!(detail["stats"]["company_count"], 2);

    let (status, archived) = app
        .call("POST", &format!("/api/v1/segments/{segment}/archive"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(archived["status"], "archived");

    // archived segments take no new companies
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/companies",
            Some(&researcher),
            Some(json!({ "segment_id": segment, "company_name": "Initech" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admins_cannot_lock_themselves_out() {
    let app = TestApp::new().await;
    let (admin_id, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;

    let (status, body) = app
        .call(
            "PUT",
            &format!("/api/v1/users/{admin_id}/roles"),
            Some(&admin),
            Some(json!({ "roles": ["approver"] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("admin role"));

    let (status, _) = app
        .call("POST", &format!("/api/v1/users/{admin_id}/deactivate"), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // keeping the admin role while adding another is fine
    let (status, me) = app
        .call(
            "PUT",
            &format!("/api/v1/users/{admin_id}/roles"),
            Some(&admin),
            Some(json!({ "roles": ["admin", "approver"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{me}");
    assert_eq!(me["status"], "active");
    let roles = me["roles"].as_array().unwrap();
    assert!(roles.contains(&json!("admin")));
    assert!(roles.contains(&json!("approver")));
}

#[tokio::test]
async fn contact_and_segment_exports() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, sdr) = app.user_token("sdr@example.com", &[Role::Sdr]).await;
    let saas = create_segment(&app, &admin).await;
    create_named_segment(&app, &admin, "Fintech EU").await;
    let acme = create_company(&app, &admin, &saas, "Acme").await;
    let globex = create_company(&app, &admin, &saas, "Globex").await;
    create_contact(&app, &admin, &acme, "one@acme.com").await;
    create_contact(&app, &admin, &acme, "two@acme.com").await;
    create_contact(&app, &admin, &globex, "one@globex.com").await;

    let lines = export_lines(&app, &admin, &format!("/api/v1/exports/contacts?company_id={acme}")).await;
    assert_eq!(lines.len(), 3, "{lines:?}");
    assert!(lines[0].starts_with("id,first_name,last_name,email"));
    assert!(lines[1..].iter().all(|l| l.contains("@acme.com")));

    let lines = export_lines(&app, &admin, "/api/v1/exports/segments?search=fintech").await;
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert!(lines[0].starts_with("id,name,"));
    assert!(lines[1].contains("Fintech EU"));

    let lines = export_lines(&app, &admin, "/api/v1/exports/segments").await;
    assert_eq!(lines.len(), 3);

    let (status, _) = app
        .call("GET", "/api/v1/exports/contacts", Some(&sdr), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bulk_assignments_are_all_or_nothing() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (owner_id, owner) = app.user_token("owner@example.com", &[Role::SegmentOwner]).await;
    let first = create_segment(&app, &admin).await;
    let second = create_named_segment(&app, &admin, "Fintech EU").await;

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/assignments/bulk",
            Some(&admin),
            Some(json!({
                "entity_type": "segment",
                "entity_ids": [first, Uuid::new_v4()],
                "assigned_to": owner_id
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, listed) = app
        .call("GET", &format!("/api/v1/assignments?assigned_to={owner_id}"), Some(&admin), None)
        .await;
    assert_eq!(listed["total"], 0);

    let (status, _) = app
        .call(
            "POST",
            "/api/v1/assignments/bulk",
            Some(&admin),
            Some(json!({ "entity_type": "segment", "entity_ids": [], "assigned_to": owner_id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, created) = app
        .call(
            "POST",
            "/api/v1/assignments/bulk",
            Some(&admin),
            Some(json!({
                "entity_type": "segment",
                "entity_ids": [first, second],
                "assigned_to": owner_id
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created.as_array().unwrap().len(), 2);

    let removed = format!("/api/v1/assignments/{}", created[0]["id"].as_str().unwrap());
    let (status, _) = app.call("DELETE", &removed, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.call("DELETE", &removed, Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, mine) = app.call("GET", "/api/v1/assignments/me", Some(&owner), None).await;
    assert_eq!(mine["total"], 1);
    let (_, inbox) = app
        .call("GET", "/api/v1/notifications/unread-count", Some(&owner), None)
        .await;
    assert_eq!(inbox["unread"], 2);
}

#[tokio::test]
async fn duplicate_detection_can_be_rerun() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, researcher) = app.user_token("r@example.com", &[Role::Researcher]).await;
    let (_, approver) = app.user_token("a@example.com", &[Role::Approver]).await;
    let segment = create_segment(&app, &admin).await;

    let csv = "company_name,company_website\nAcme,acme.com\nAcme,acme.com\n";
    let resp = app
        .send(upload_request(
            &researcher,
            multipart("XBOUNDARY", &segment, "companies.csv", csv),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let flagged_uri = format!("/api/v1/companies?segment_id={segment}&is_duplicate=true");
    let (_, flagged) = app.call("GET", &flagged_uri, Some(&admin), None).await;
    assert_eq!(flagged["total"], 1);
    let later = flagged["items"][0]["id"].as_str().unwrap().to_string();

    // clear the flag by hand, then let detection put it back
    let (status, _) = app
        .call(
            "POST",
            &format!("/api/v1/companies/{later}/duplicate"),
            Some(&admin),
            Some(json!({ "is_duplicate": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let detect = format!("/api/v1/segments/{segment}/detect-duplicates");
    let (status, _) = app.call("POST", &detect, Some(&researcher), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, result) = app.call("POST", &detect, Some(&approver), None).await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["duplicates_marked"], 1);
    let (_, flagged) = app.call("GET", &flagged_uri, Some(&admin), None).await;
    assert_eq!(flagged["items"][0]["id"], later.as_str());

    let (status, result) = app.call("POST", &detect, Some(&approver), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["duplicates_marked"], 0);

    // a stale flag on the earliest contact is cleared
    let company = create_company(&app, &admin, &segment, "Initech").await;
    let earliest = create_contact(&app, &admin, &company, "peter@initech.com").await;
    create_contact(&app, &admin, &company, "milton@initech.com").await;
    let (status, _) = app
        .call(
            "POST",
            &format!("/api/v1/contacts/{earliest}/duplicate"),
            Some(&admin),
            Some(json!({ "is_duplicate": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, result) = app
        .call(
            "POST",
            &format!("/api/v1/companies/{company}/detect-duplicates"),
            Some(&approver),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["duplicates_marked"], 0);
    let (_, contact) = app
        .call("GET", &format!("/api/v1/contacts/{earliest}"), Some(&admin), None)
        .await;
    assert_eq!(contact["is_duplicate"], false);

    let (status, _) = app
        .call(
            "POST",
            &format!("/api/v1/companies/{}/detect-duplicates", Uuid::new_v4()),
            Some(&approver),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn marketing_collateral_links() {
    let app = TestApp::new().await;
    let (_, admin) = app.user_token("admin@example.com", &[Role::Admin]).await;
    let (_, marketing) = app.user_token("m@example.com", &[Role::Marketing]).await;
    let (_, researcher) = app.user_token("r@example.com", &[Role::Researcher]).await;
    let segment = create_segment(&app, &admin).await;
    let company = create_company(&app, &admin, &segment, "Acme").await;
    let lead = create_contact(&app, &admin, &company, "wile@acme.com").await;

    let deck = json!({
        "title": "Q3 pitch deck",
        "url": "https://cdn.example.com/q3-deck.pdf",
        "description": "Slides for mid-market prospects",
        "scope_type": "lead",
        "scope_id": lead,
        "segment_id": segment
    });
    let (status, _) = app
        .call("POST", "/api/v1/marketing", Some(&researcher), Some(deck.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = app
        .call("POST", "/api/v1/marketing", Some(&marketing), Some(deck))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["scope_type"], "lead");
    let id = created["id"].as_str().unwrap().to_string();

    // the scope must point at an existing row
    let (status, body) = app
        .call(
            "POST",
            "/api/v1/marketing",
            Some(&marketing),
            Some(json!({
                "title": "Orphan",
                "url": "https://example.com",
                "scope_type": "segment",
                "scope_id": Uuid::new_v4()
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
    let (status, _) = app
        .call(
            "POST",
            "/api/v1/marketing",
            Some(&marketing),
            Some(json!({ "title": " ", "url": "https://example.com", "scope_type": "segment", "scope_id": segment })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, listed) = app
        .call("GET", "/api/v1/marketing?scope_type=lead&search=pitch", Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    let (_, none) = app
        .call("GET", "/api/v1/marketing?scope_type=offering", Some(&researcher), None)
        .await;
    assert_eq!(none["total"], 0);

    let (status, updated) = app
        .call(
            "PATCH",
            &format!("/api/v1/marketing/{id}"),
            Some(&marketing),
            Some(json!({ "title": "Q3 pitch deck v2" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["title"], "Q3 pitch deck v2");
    assert_eq!(updated["url"], "https://cdn.example.com/q3-deck.pdf");

    let (_, logs) = app
        .call(
            "GET",
            &format!("/api/v1/audit-logs?entity_type=contact&entity_id={lead}"),
            Some(&admin),
            None,
        )
        .await;
    let actions: Vec<&str> = logs["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    assert!(actions.contains(&"collateral.create"));
    assert!(actions.contains(&"collateral.update"));

    let (status, _) = app
        .call("DELETE", &format!("/api/v1/marketing/{id}"), Some(&marketing), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app
        .call("GET", &format!("/api/v1/marketing/{id}"), Some(&researcher), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
