use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse},
};

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Flattop - Sign in</title></head>
<body>
  <h1>Flattop</h1>
  <form id="login">
    <input name="username" placeholder="Username" autocomplete="username" required>
    <input name="password" type="password" placeholder="Password" autocomplete="current-password" required>
    <button type="submit">Log in</button>
    <button type="button" id="register">Register</button>
  </form>
  <p id="message"></p>
  <script>
    const form = document.getElementById('login');
    const message = document.getElementById('message');
    const credentials = () => JSON.stringify(Object.fromEntries(new FormData(form)));
    const next = new URLSearchParams(location.search).get('next') || '/board/';
    async function login() {
      const res = await fetch('/accounts/login', {
        method: 'POST', headers: {'Content-Type': 'application/json'}, body: credentials()
      });
      if (res.ok) { location.href = next.startsWith('/') ? next : '/board/'; }
      else { message.textContent = 'Invalid username or password.'; }
    }
    form.addEventListener('submit', e => { e.preventDefault(); login(); });
    document.getElementById('register').addEventListener('click', async () => {
      const res = await fetch('/accounts/register', {
        method: 'POST', headers: {'Content-Type': 'application/json'}, body: credentials()
      });
      if (res.status === 201) { login(); }
      else { message.textContent = (await res.json().catch(() => ({}))).error || 'Registration failed.'; }
    });
  </script>
</body>
</html>
"#;

const BOARD_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Flattop - Board</title></head>
<body>
  <div id="board"></div>
  <form id="card-upload">
    <input type="file" name="image" accept="image/*" required>
    <button type="submit">Add card</button>
  </form>
  <script>
    document.getElementById('card-upload').addEventListener('submit', async e => {
      e.preventDefault();
      const res = await fetch('/board/api/upload_card_image/', {
        method: 'POST', body: new FormData(e.target), credentials: 'same-origin'
      });
      const data = await res.json();
      if (!res.ok) { alert(data.error); return; }
      const img = document.createElement('img');
      img.src = data.url;
      img.dataset.cardImageId = data.id;
      img.width = 120;
      document.getElementById('board').appendChild(img);
    });
  </script>
</body>
</html>
"#;

pub async fn index(State(state): State<crate::AppState>) -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [(header::LOCATION, state.config.login_url.clone())],
    )
}

pub async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

/// Requires an authenticated session; see `page_auth_middleware`.
pub async fn board() -> Html<&'static str> {
    Html(BOARD_PAGE)
}
