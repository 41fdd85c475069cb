mod lifecycle;
mod rebind;
